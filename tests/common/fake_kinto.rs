//! Minimal Kinto HTTP server for exercising `KintoClient`.
//!
//! Serves collection metadata, record listing and single-record reads from a
//! fixed record list, answers `/batch` with a canned or echoed response, and
//! records every request it receives.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A request as seen by the server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

#[derive(Default)]
pub struct FakeState {
    pub records: Mutex<Vec<Value>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
    /// Collection timestamp, returned as the quoted `ETag`.
    pub timestamp: Mutex<u64>,
    /// Send a `Next-Page` header on listings.
    pub next_page: Mutex<bool>,
    /// Canned `/batch` body. `None` echoes every sub-request as a 201.
    pub batch_body: Mutex<Option<Value>>,
    /// Force every response to this status.
    pub fail_with: Mutex<Option<u16>>,
}

/// Running fake server. Aborted on drop.
pub struct FakeKinto {
    pub url: String,
    pub state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl FakeKinto {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new()
            .route("/v1/buckets/:bucket/collections/:collection", get(collection_info))
            .route(
                "/v1/buckets/:bucket/collections/:collection/records",
                get(list_records),
            )
            .route(
                "/v1/buckets/:bucket/collections/:collection/records/:id",
                get(get_record),
            )
            .route("/v1/batch", post(batch))
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}/v1", addr),
            state,
            task,
        }
    }

    pub fn add_record(&self, record: Value) {
        if let Some(marker) = record.get("last_modified").and_then(Value::as_u64) {
            let mut timestamp = self.state.timestamp.lock().unwrap();
            *timestamp = (*timestamp).max(marker);
        }
        self.state.records.lock().unwrap().push(record);
    }

    pub fn set_next_page(&self, next_page: bool) {
        *self.state.next_page.lock().unwrap() = next_page;
    }

    pub fn set_batch_body(&self, body: Value) {
        *self.state.batch_body.lock().unwrap() = Some(body);
    }

    pub fn fail_with(&self, status: u16) {
        *self.state.fail_with.lock().unwrap() = Some(status);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Recorded requests whose path ends with `suffix`.
    pub fn requests_to(&self, suffix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with(suffix))
            .collect()
    }
}

impl Drop for FakeKinto {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn record(
    state: &FakeState,
    method: Method,
    uri: &Uri,
    query: HashMap<String, String>,
    headers: &HeaderMap,
    body: Option<Value>,
) {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers,
        body,
    });
}

fn forced_failure(state: &FakeState) -> Option<Response> {
    let status = (*state.fail_with.lock().unwrap())?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Some((status, Json(json!({ "code": status.as_u16() }))).into_response())
}

fn etag_headers(state: &FakeState) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let timestamp = *state.timestamp.lock().unwrap();
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", timestamp)) {
        headers.insert("etag", value);
    }
    headers
}

async fn collection_info(
    State(state): State<Arc<FakeState>>,
    Path((_bucket, collection)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, method, &uri, HashMap::new(), &headers, None);
    if let Some(failure) = forced_failure(&state) {
        return failure;
    }
    let timestamp = *state.timestamp.lock().unwrap();
    let body = json!({ "data": { "id": collection, "last_modified": timestamp } });
    (etag_headers(&state), Json(body)).into_response()
}

async fn list_records(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, method, &uri, query.clone(), &headers, None);
    if let Some(failure) = forced_failure(&state) {
        return failure;
    }

    let since = query
        .get("_since")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let data: Vec<Value> = state
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.get("last_modified").and_then(Value::as_u64).unwrap_or(0) > since)
        .cloned()
        .collect();

    let mut response_headers = etag_headers(&state);
    if *state.next_page.lock().unwrap() {
        response_headers.insert(
            "next-page",
            HeaderValue::from_static("http://localhost/next"),
        );
    }
    (response_headers, Json(json!({ "data": data }))).into_response()
}

async fn get_record(
    State(state): State<Arc<FakeState>>,
    Path((_bucket, _collection, id)): Path<(String, String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    record(&state, method, &uri, HashMap::new(), &headers, None);
    if let Some(failure) = forced_failure(&state) {
        return failure;
    }

    let found = state
        .records
        .lock()
        .unwrap()
        .iter()
        .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
        .cloned();
    match found {
        Some(data) => Json(json!({ "data": data })).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "code": 404, "errno": 110, "error": "Not Found" })),
        )
            .into_response(),
    }
}

async fn batch(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    record(&state, method, &uri, HashMap::new(), &headers, Some(payload.clone()));
    if let Some(failure) = forced_failure(&state) {
        return failure;
    }

    if let Some(canned) = state.batch_body.lock().unwrap().clone() {
        return Json(canned).into_response();
    }

    let mut timestamp = state.timestamp.lock().unwrap();
    let responses: Vec<Value> = payload
        .get("requests")
        .and_then(Value::as_array)
        .map(|requests| {
            requests
                .iter()
                .map(|request| {
                    *timestamp += 1;
                    let mut data = request
                        .pointer("/body/data")
                        .cloned()
                        .unwrap_or_else(|| json!({}));
                    data["last_modified"] = json!(*timestamp);
                    json!({
                        "status": 201,
                        "path": request.get("path").cloned().unwrap_or(Value::Null),
                        "body": { "data": data },
                        "headers": {},
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Json(json!({ "responses": responses })).into_response()
}
