//! Fuzz target for batch response aggregation.
//!
//! Feeds arbitrary bytes as a `/batch` response body. Aggregation may reject
//! it, but must never panic, and an accepted result accounts for every
//! request exactly once.

#![no_main]

use kinto_replication::batch::{aggregate, BatchRequest, BatchResponse};
use kinto_replication::document::{ChangeRow, Document};
use kinto_replication::RemoteConfig;
use libfuzzer_sys::fuzz_target;
use serde_json::Map;

fuzz_target!(|data: &[u8]| {
    let Ok(responses) = serde_json::from_slice::<Vec<BatchResponse>>(data) else {
        return;
    };

    let remote = RemoteConfig::default();
    let requests: Vec<BatchRequest> = (0..responses.len())
        .map(|i| {
            let row = ChangeRow::create(Document::new(format!("r{}", i), Map::new()));
            BatchRequest::from_row(&row, &remote)
        })
        .collect();

    if let Ok(result) = aggregate(&requests, responses) {
        assert_eq!(result.indices(), (0..requests.len()).collect::<Vec<_>>());
    }
});
