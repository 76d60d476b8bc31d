//! Fuzz target for ETag parsing.
//!
//! Arbitrary header values must parse without panicking, and a parsed marker
//! is never blank or padded.

#![no_main]

use kinto_replication::remote::parse_etag;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Some(marker) = parse_etag(data) {
        assert!(!marker.is_empty());
        assert_eq!(marker.trim(), marker);
    }
});
