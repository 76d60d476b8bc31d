//! Fuzz target for checkpoint marker ordering.
//!
//! Marker comparison must never panic and must stay antisymmetric, since
//! checkpoints rely on it to never move backwards.

#![no_main]

use kinto_replication::document::{compare_markers, Checkpoint};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_markers(a, b);
    let ba = compare_markers(b, a);
    assert_eq!(ab, ba.reverse());

    // Advancing never rewinds
    let current = Checkpoint::at(a);
    let next = current.advance(&Checkpoint::at(b));
    assert!(!current.is_after(&next));
});
