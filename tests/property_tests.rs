//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use kinto_replication::batch::{aggregate, BatchRequest, BatchResponse};
use kinto_replication::conflict::{ClientWins, ConflictResolver, ManualResolution, RemoteWins};
use kinto_replication::document::compare_markers;
use kinto_replication::resilience::{Backoff, RetryConfig};
use kinto_replication::{ChangeRow, Checkpoint, Document, RemoteConfig};
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::time::Duration;

fn doc(id: &str, title: &str) -> Document {
    let mut fields = Map::new();
    fields.insert("title".to_string(), json!(title));
    Document::new(id, fields)
}

fn requests(count: usize) -> Vec<BatchRequest> {
    let remote = RemoteConfig::default();
    (0..count)
        .map(|i| BatchRequest::from_row(&ChangeRow::create(doc(&format!("r{}", i), "x")), &remote))
        .collect()
}

fn response_for(request: &BatchRequest, status: u16) -> BatchResponse {
    let body = match status {
        409 | 412 => json!({ "details": { "existing": Value::Null } }),
        200..=299 => json!({ "data": { "id": request.id(), "last_modified": 1 } }),
        _ => json!({ "code": status }),
    };
    BatchResponse::new(status, request.path.clone(), body)
}

fn status() -> impl Strategy<Value = u16> {
    prop_oneof![
        Just(200u16),
        Just(201),
        Just(404),
        Just(409),
        Just(412),
        Just(400),
        Just(403),
        Just(500),
        Just(503),
        100u16..600,
    ]
}

fn marker() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u64..1_000_000).prop_map(|n| n.to_string()),
        "[a-z0-9]{1,8}",
    ]
}

// =============================================================================
// Batch Aggregation Properties
// =============================================================================

proptest! {
    /// Every request lands in exactly one bucket.
    #[test]
    fn aggregate_partitions_every_index_once(statuses in prop::collection::vec(status(), 0..40)) {
        let reqs = requests(statuses.len());
        let responses = reqs.iter().zip(&statuses).map(|(r, s)| response_for(r, *s)).collect();

        let result = aggregate(&reqs, responses).unwrap();

        prop_assert_eq!(result.total(), statuses.len());
        prop_assert_eq!(result.indices(), (0..statuses.len()).collect::<Vec<_>>());
    }

    /// Buckets follow the status classes.
    #[test]
    fn aggregate_buckets_match_status(statuses in prop::collection::vec(status(), 1..40)) {
        let reqs = requests(statuses.len());
        let responses = reqs.iter().zip(&statuses).map(|(r, s)| response_for(r, *s)).collect();

        let result = aggregate(&reqs, responses).unwrap();

        for entry in &result.published {
            prop_assert!((200..300).contains(&statuses[entry.index]));
        }
        for entry in &result.skipped {
            prop_assert_eq!(statuses[entry.index], 404);
        }
        for entry in &result.conflicts {
            prop_assert!(matches!(statuses[entry.index], 409 | 412));
        }
        for entry in &result.errors {
            let s = statuses[entry.index];
            prop_assert!(!(200..300).contains(&s) && !matches!(s, 404 | 409 | 412));
        }
    }

    /// Mismatched counts are rejected rather than misattributed.
    #[test]
    fn aggregate_rejects_count_mismatch(sent in 0usize..20, extra in 1usize..5) {
        let reqs = requests(sent);
        let responses = requests(sent + extra)
            .iter()
            .map(|r| response_for(r, 200))
            .collect();

        prop_assert!(aggregate(&reqs, responses).is_err());
    }
}

// =============================================================================
// Conflict Resolution Properties
// =============================================================================

proptest! {
    /// Resolvers are pure: the same pair gives the same verdict.
    #[test]
    fn resolvers_are_deterministic(local in "[a-z]{0,6}", remote in "[a-z]{0,6}") {
        let local = doc("a", &local);
        let remote = doc("a", &remote).with_last_modified(5);

        let resolvers: [&dyn ConflictResolver; 3] = [&RemoteWins, &ClientWins, &ManualResolution];
        for resolver in resolvers {
            prop_assert_eq!(resolver.resolve(&local, &remote), resolver.resolve(&local, &remote));
        }
    }

    /// Equal content is reported as equal by every built-in strategy.
    #[test]
    fn equal_content_is_always_equal(title in "[a-z]{0,6}", lm in 0u64..1000) {
        let local = doc("a", &title);
        let remote = doc("a", &title).with_last_modified(lm);

        prop_assert!(RemoteWins.resolve(&local, &remote).unwrap().is_equal());
        prop_assert!(ClientWins.resolve(&local, &remote).unwrap().is_equal());
        prop_assert!(ManualResolution.resolve(&local, &remote).unwrap().is_equal());
    }
}

// =============================================================================
// Marker and Checkpoint Properties
// =============================================================================

proptest! {
    /// Marker comparison is antisymmetric.
    #[test]
    fn marker_order_antisymmetric(a in marker(), b in marker()) {
        prop_assert_eq!(compare_markers(&a, &b), compare_markers(&b, &a).reverse());
    }

    /// Marker comparison is transitive.
    #[test]
    fn marker_order_transitive(a in marker(), b in marker(), c in marker()) {
        let mut sorted = [a, b, c];
        sorted.sort_by(|x, y| compare_markers(x, y));
        prop_assert_ne!(compare_markers(&sorted[0], &sorted[1]), Ordering::Greater);
        prop_assert_ne!(compare_markers(&sorted[1], &sorted[2]), Ordering::Greater);
        prop_assert_ne!(compare_markers(&sorted[0], &sorted[2]), Ordering::Greater);
    }

    /// Numeric markers order numerically, not lexically.
    #[test]
    fn numeric_markers_order_numerically(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
        prop_assert_eq!(compare_markers(&a.to_string(), &b.to_string()), a.cmp(&b));
    }

    /// Advancing through any sequence of candidates never moves backwards.
    #[test]
    fn checkpoint_never_rewinds(candidates in prop::collection::vec(0u64..10_000, 1..30)) {
        let mut checkpoint = Checkpoint::start();
        for candidate in candidates {
            let next = checkpoint.advance(&Checkpoint::at(candidate.to_string()));
            prop_assert!(!checkpoint.is_after(&next));
            checkpoint = next;
        }
    }
}

// =============================================================================
// Backoff Properties
// =============================================================================

proptest! {
    /// Delays never decrease and never exceed the ceiling.
    #[test]
    fn backoff_monotonic_and_capped(
        initial_ms in 1u64..1_000,
        max_ms in 1u64..60_000,
        failures in 1usize..64,
    ) {
        let config = RetryConfig::forever(
            Duration::from_millis(initial_ms),
            Duration::from_millis(max_ms),
        );
        let mut backoff = Backoff::new(config.clone());

        let mut previous = Duration::ZERO;
        for _ in 0..failures {
            let delay = backoff.next_delay();
            prop_assert!(delay >= previous);
            prop_assert!(delay <= config.max_delay);
            previous = delay;
        }
    }

    /// A success resets the schedule to its floor.
    #[test]
    fn backoff_resets_to_floor(initial_ms in 1u64..1_000, failures in 1usize..20) {
        let config = RetryConfig::forever(Duration::from_millis(initial_ms), Duration::from_secs(300));
        let mut backoff = Backoff::new(config);

        for _ in 0..failures {
            backoff.next_delay();
        }
        backoff.reset();

        prop_assert_eq!(backoff.failures(), 0);
        prop_assert_eq!(backoff.next_delay(), Duration::from_millis(initial_ms));
    }
}
