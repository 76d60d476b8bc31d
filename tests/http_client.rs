// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP Tests for the Kinto Client
//!
//! Runs `KintoClient` against an in-process axum server that speaks the
//! Kinto record API, so no external server is needed.
//!
//! # Test Organization
//! - `client_*` - Request shape and response parsing per operation
//! - `replication_*` - A full replication over HTTP

#[macro_use]
mod common;

use common::{titled, FakeKinto};
use kinto_replication::{
    AuthConfig, BatchRequest, ChangeRow, Checkpoint, CheckpointStore, ErrorKind, KintoClient,
    MemoryCheckpointStore, MemoryCollection, RemoteCollection, RemoteConfig, Replication,
    ReplicationConfig, ReplicationState,
};
use serde_json::json;
use std::sync::Arc;

fn client(server: &FakeKinto) -> KintoClient {
    KintoClient::new(RemoteConfig::new(&server.url, "app", "todos")).unwrap()
}

// =============================================================================
// Client Tests
// =============================================================================

#[tokio::test]
async fn client_list_changes_sends_filters_and_reads_etag() {
    let server = FakeKinto::start().await;
    server.add_record(json!({ "id": "a", "title": "old", "last_modified": 5 }));
    server.add_record(json!({ "id": "b", "title": "new", "last_modified": 12 }));

    let mut config = RemoteConfig::new(&server.url, "app", "todos");
    config.exclude = vec!["x".to_string(), "y".to_string()];
    config.expected_timestamp = Some(42);
    let client = KintoClient::new(config).unwrap();

    let page = client.list_changes(&Checkpoint::at("5"), 10).await.unwrap();

    assert_eq!(page.documents.len(), 1);
    assert_eq!(page.documents[0].id, "b");
    assert_eq!(page.documents[0].last_modified, Some(12));
    assert_eq!(page.last_modified.as_deref(), Some("12"));
    assert!(!page.has_more);

    let request = &server.requests_to("/records")[0];
    assert_eq!(request.path, "/v1/buckets/app/collections/todos/records");
    assert_eq!(request.query["_sort"], "last_modified");
    assert_eq!(request.query["_limit"], "10");
    assert_eq!(request.query["_since"], "5");
    assert_eq!(request.query["exclude_id"], "x,y");
    assert_eq!(request.query["_expected"], "42");
}

#[tokio::test]
async fn client_list_changes_from_start_omits_since() {
    let server = FakeKinto::start().await;
    server.add_record(json!({ "id": "a", "last_modified": 1 }));
    server.set_next_page(true);

    let page = client(&server)
        .list_changes(&Checkpoint::start(), 1)
        .await
        .unwrap();

    assert!(page.has_more);
    let request = &server.requests_to("/records")[0];
    assert!(!request.query.contains_key("_since"));
    assert!(!request.query.contains_key("exclude_id"));
}

#[tokio::test]
async fn client_maps_deleted_records_to_tombstones() {
    let server = FakeKinto::start().await;
    server.add_record(json!({ "id": "a", "deleted": true, "last_modified": 3 }));

    let page = client(&server)
        .list_changes(&Checkpoint::start(), 10)
        .await
        .unwrap();

    assert!(page.documents[0].deleted);
    assert!(page.documents[0].fields.is_empty());
}

#[tokio::test]
async fn client_sends_auth_and_static_headers() {
    let server = FakeKinto::start().await;
    let mut config = RemoteConfig::new(&server.url, "app", "todos");
    config.auth = AuthConfig::Basic {
        username: "user".to_string(),
        password: "pass".to_string(),
    };
    config.headers.insert("X-App".to_string(), "demo".to_string());
    let client = KintoClient::new(config).unwrap();

    let info = client.info().await.unwrap();
    assert_eq!(info.last_modified.as_deref(), Some("0"));

    let request = &server.requests()[0];
    assert_eq!(request.headers["authorization"], "Basic dXNlcjpwYXNz");
    assert_eq!(request.headers["x-app"], "demo");
}

#[tokio::test]
async fn client_get_record_missing_is_none() {
    let server = FakeKinto::start().await;
    server.add_record(json!({ "id": "a", "title": "here", "last_modified": 1 }));
    let client = client(&server);

    let found = client.get_record("a").await.unwrap().unwrap();
    assert_eq!(found.fields["title"], json!("here"));
    assert!(client.get_record("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn client_batch_write_sends_defaults_and_sub_requests() {
    let server = FakeKinto::start().await;
    let mut config = RemoteConfig::new(&server.url, "app", "todos");
    config.auth = AuthConfig::Bearer {
        token: "secret".to_string(),
    };
    let client = KintoClient::new(config.clone()).unwrap();

    let requests = vec![
        BatchRequest::from_row(&ChangeRow::create(titled("a", "new")), &config),
        BatchRequest::from_row(
            &ChangeRow::update(titled("b", "old").with_last_modified(7), titled("b", "edit")),
            &config,
        ),
    ];
    let responses = client.batch_write(&requests).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.status == 201));

    let sent = server.requests_to("/batch")[0].body.clone().unwrap();
    assert_eq!(sent["defaults"]["headers"]["authorization"], json!("Bearer secret"));

    let first = &sent["requests"][0];
    assert_eq!(first["method"], json!("PUT"));
    assert_eq!(first["path"], json!("/buckets/app/collections/todos/records/a"));
    assert_eq!(first["headers"]["If-None-Match"], json!("*"));
    assert_eq!(first["body"]["data"], json!({ "id": "a", "title": "new" }));

    let second = &sent["requests"][1];
    assert_eq!(second["method"], json!("PATCH"));
    assert_eq!(second["headers"]["If-Match"], json!("\"7\""));
    assert!(second.get("row").is_none());
}

#[tokio::test]
async fn client_classifies_http_failures() {
    let server = FakeKinto::start().await;
    let client = client(&server);

    server.fail_with(503);
    let err = client.list_changes(&Checkpoint::start(), 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());

    server.fail_with(400);
    let err = client.list_changes(&Checkpoint::start(), 10).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.is_fatal());
}

// =============================================================================
// Replication Tests
// =============================================================================

#[tokio::test]
async fn replication_round_trip_over_http() {
    common::init_tracing();
    let server = FakeKinto::start().await;
    server.add_record(json!({ "id": "r1", "title": "remote", "last_modified": 10 }));
    server.add_record(json!({ "id": "r2", "title": "remote", "last_modified": 11 }));

    let collection = Arc::new(MemoryCollection::new());
    collection.put(titled("l1", "local")).await;
    let checkpoints = Arc::new(MemoryCheckpointStore::new());

    let mut config = ReplicationConfig::for_testing("todos");
    config.remote = RemoteConfig::new(&server.url, "app", "todos");
    config.live = false;

    let handle = Replication::kinto(config, collection.clone())
        .unwrap()
        .with_checkpoints(checkpoints.clone())
        .start()
        .await
        .unwrap();
    handle.await_initial_replication().await.unwrap();
    common::wait_for_state(&handle, ReplicationState::Stopped).await;

    assert!(collection.master("r1").await.is_some());
    assert!(collection.master("r2").await.is_some());
    assert_eq!(collection.pending_count().await, 0);
    assert_eq!(collection.master("l1").await.unwrap().last_modified, Some(12));

    let batch = &server.requests_to("/batch")[0];
    let sent = batch.body.as_ref().unwrap();
    assert_eq!(sent["requests"].as_array().unwrap().len(), 1);
    assert_eq!(sent["requests"][0]["path"], json!("/buckets/app/collections/todos/records/l1"));

    eventually!(
        "checkpoint",
        checkpoints.get("todos").await.unwrap() == Some(Checkpoint::at("11"))
    );
}
