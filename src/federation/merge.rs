//! Deterministic merge of two event logs.
//!
//! Canonical union: dedupe by id (an id collision with differing content
//! keeps the record with the lexicographically smaller content hash), sort by
//! (content_hash, timestamp, signer_id), and emit a merge receipt binding the
//! left, right, and merged roots. The merge is commutative and associative in
//! content: roots come out byte-identical regardless of argument order or
//! grouping.
//!
//! The policy identifier is versioned so future merges can reject mixed
//! policies.

use crate::federation::canonical::canonical_json;
use crate::federation::merkle::project_root;
use crate::federation::record::MemoryRecord;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const MERGE_POLICY: &str = "canonical-union-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeReceipt {
    pub left_root: String,
    pub right_root: String,
    pub merged_root: String,
    pub events_replayed: u64,
    pub policy: String,
    pub sort_order: String,
    pub timestamp: String,
}

/// Merge two event lists into a deterministic union.
pub fn deterministic_merge(
    left: &[MemoryRecord],
    right: &[MemoryRecord],
) -> (Vec<MemoryRecord>, MergeReceipt) {
    let mut by_id: BTreeMap<String, MemoryRecord> = BTreeMap::new();
    for record in left.iter().chain(right.iter()) {
        match by_id.get(&record.id) {
            None => {
                by_id.insert(record.id.clone(), record.clone());
            }
            Some(existing) => {
                if record.content_hash() < existing.content_hash() {
                    by_id.insert(record.id.clone(), record.clone());
                }
            }
        }
    }

    let mut merged: Vec<MemoryRecord> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        let ka = (
            a.content_hash(),
            a.timestamp.clone(),
            a.signer_id.clone().unwrap_or_default(),
        );
        let kb = (
            b.content_hash(),
            b.timestamp.clone(),
            b.signer_id.clone().unwrap_or_default(),
        );
        ka.cmp(&kb)
    });

    let receipt = MergeReceipt {
        left_root: project_root(left),
        right_root: project_root(right),
        merged_root: project_root(&merged),
        events_replayed: merged.len() as u64,
        policy: MERGE_POLICY.to_string(),
        sort_order: "content_hash asc, timestamp asc, signer_id asc".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (merged, receipt)
}

impl MergeReceipt {
    /// Persist the receipt as canonical JSON under a root-derived name.
    pub fn persist(&self, dir: &Path) -> Result<std::path::PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create receipts dir {}", dir.display()))?;
        let name = format!("merge-{}.receipt", &self.merged_root[..16.min(self.merged_root.len())]);
        let path = dir.join(name);
        std::fs::write(&path, canonical_json(self)?)
            .with_context(|| format!("write merge receipt {}", path.display()))?;
        Ok(path)
    }
}
