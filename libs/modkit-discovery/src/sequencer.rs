//! Ordering of ephemeral-sequential siblings.
//!
//! The service appends a strictly increasing, zero-padded counter to every
//! sequential node, so sorting by that suffix recovers creation order. The
//! lowest suffix is the earliest live registrant.

use std::collections::BTreeMap;

/// Width of the server-assigned sequence suffix.
pub const SEQUENCE_DIGITS: usize = 10;

/// Parse the sequence suffix of a node name.
///
/// Returns `None` when the name is not longer than the suffix or the last
/// [`SEQUENCE_DIGITS`] characters are not all ASCII digits.
#[must_use]
pub fn sequence_of(name: &str) -> Option<u64> {
    if name.len() <= SEQUENCE_DIGITS {
        return None;
    }
    let suffix = name.get(name.len() - SEQUENCE_DIGITS..)?;
    if !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Order sibling names ascending by their sequence suffix.
///
/// Names without a parseable suffix are dropped. If two names carry the same
/// sequence the later one wins.
#[must_use]
pub fn order_by_sequence<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut ordered: BTreeMap<u64, &str> = BTreeMap::new();
    for name in names {
        let name = name.as_ref();
        let Some(seq) = sequence_of(name) else {
            tracing::debug!(node = %name, "skipping node without a sequence suffix");
            continue;
        };
        if let Some(previous) = ordered.insert(seq, name) {
            tracing::warn!(
                sequence = seq,
                kept = %name,
                dropped = %previous,
                "duplicate sequence number among sibling nodes"
            );
        }
    }
    ordered.into_values().map(str::to_owned).collect()
}
