//! Hashing utilities for tabletloc
//!
//! HRW (Highest Random Weight) hashing gives every tablet a stable ranking
//! of tablet servers, so placement only moves tablets whose server left.

use crate::common::ServerId;

fn weight(key: &str, node: &str) -> u64 {
    let combined = format!("{}{}", key, node);
    let hash = blake3::hash(combined.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// HRW (Highest Random Weight) hashing for placement
///
/// Given a key and a set of servers, returns servers sorted by their weight
/// (deterministic based on key).
pub fn hrw_hash(key: &str, servers: &[ServerId]) -> Vec<ServerId> {
    let mut weights: Vec<(&ServerId, u64)> = servers
        .iter()
        .map(|server| (server, weight(key, server.as_str())))
        .collect();

    // Sort by weight (descending), ties broken by id for determinism
    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    weights.into_iter().map(|(server, _)| server.clone()).collect()
}

/// Highest-ranked server for a key
pub fn hrw_select(key: &str, servers: &[ServerId]) -> Option<ServerId> {
    hrw_hash(key, servers).into_iter().next()
}
