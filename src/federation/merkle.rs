//! Merkle projection over the federation log.
//!
//! Each leaf is SHA-256 of the canonical JSON of a record's projection;
//! internal nodes hash the byte-concatenation of their children; an odd
//! trailing leaf pairs with itself. The empty log projects to SHA-256 of the
//! empty string. Roots are stable under reordering only insofar as the input
//! order is: callers hash the append-ordered projection.

use crate::federation::canonical::canonical_json;
use crate::federation::record::MemoryRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Merkle root over raw leaf digests, hex-encoded.
pub fn merkle_root_hex(leaves: &[[u8; 32]]) -> String {
    if leaves.is_empty() {
        return hex::encode(Sha256::digest(b""));
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let a = pair[0];
            let b = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut hasher = Sha256::new();
            hasher.update(a);
            hasher.update(b);
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    hex::encode(level[0])
}

/// Leaf digest of one record.
pub fn leaf_hash(record: &MemoryRecord) -> [u8; 32] {
    let canonical = canonical_json(&record.projection()).expect("projection is valid JSON");
    Sha256::digest(canonical.as_bytes()).into()
}

/// Root over records in the given (append) order.
pub fn project_root(records: &[MemoryRecord]) -> String {
    let leaves: Vec<[u8; 32]> = records.iter().map(leaf_hash).collect();
    merkle_root_hex(&leaves)
}

/// Projection summary exchanged between peers. Computed on demand, never
/// stored inline with events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProjection {
    pub node_id: String,
    pub timestamp: String,
    pub root: String,
    pub count: u64,
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub vector_clock: BTreeMap<String, u64>,
}

impl MerkleProjection {
    pub fn compute(node_id: &str, records: &[MemoryRecord]) -> Self {
        Self {
            node_id: node_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            root: project_root(records),
            count: records.len() as u64,
            signatures: Vec::new(),
            vector_clock: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, payload: &str) -> MemoryRecord {
        let mut r = MemoryRecord::new(
            "event",
            "test",
            "1",
            serde_json::json!({ "payload": payload }),
        );
        r.id = id.to_string();
        r.timestamp = "2026-01-01T00:00:00Z".to_string();
        r
    }

    #[test]
    fn test_empty_log_projects_to_hash_of_empty_string() {
        assert_eq!(
            merkle_root_hex(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let r = rec("1", "x");
        let leaf = leaf_hash(&r);
        assert_eq!(project_root(&[r]), hex::encode(leaf));
    }

    #[test]
    fn test_odd_trailing_leaf_duplicates_itself() {
        let a = rec("1", "a");
        let b = rec("2", "b");
        let c = rec("3", "c");

        // root(a,b,c) = H(H(la||lb) || H(lc||lc))
        let la = leaf_hash(&a);
        let lb = leaf_hash(&b);
        let lc = leaf_hash(&c);
        let mut h = Sha256::new();
        h.update(la);
        h.update(lb);
        let left: [u8; 32] = h.finalize().into();
        let mut h = Sha256::new();
        h.update(lc);
        h.update(lc);
        let right: [u8; 32] = h.finalize().into();
        let mut h = Sha256::new();
        h.update(left);
        h.update(right);
        let expected = hex::encode(h.finalize());

        assert_eq!(project_root(&[a, b, c]), expected);
    }

    #[test]
    fn test_root_changes_iff_canonical_form_changes() {
        let a = rec("1", "a");
        let b = rec("2", "b");
        let base = project_root(&[a.clone(), b.clone()]);

        // Volatile fields do not change the root
        let mut a_volatile = a.clone();
        a_volatile.merkle_root = Some("cafe".to_string());
        assert_eq!(project_root(&[a_volatile, b.clone()]), base);

        // Payload change does
        let a_changed = rec("1", "a-changed");
        assert_ne!(project_root(&[a_changed, b]), base);
    }

    #[test]
    fn test_root_is_deterministic() {
        let records = vec![rec("1", "a"), rec("2", "b"), rec("3", "c"), rec("4", "d")];
        assert_eq!(project_root(&records), project_root(&records));
    }
}
