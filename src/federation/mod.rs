//! Federation: content-addressed reconciliation of per-node memory logs.
//!
//! - `canonical`: canonical JSON encoding shared by hashing and receipts
//! - `record`: the self-describing memory record and signature policy
//! - `merkle`: Merkle projections over canonical record forms
//! - `log`: append-only framed federation log with id index
//! - `merge`: deterministic canonical-union of two event logs
//! - `conflict`: anchor-class conflict resolution
//! - `client` / `sync`: peer reconciliation with backoff and bounded workers

pub mod canonical;
pub mod client;
pub mod conflict;
pub mod log;
pub mod merge;
pub mod merkle;
pub mod record;
pub mod sync;

pub use canonical::canonical_json;
pub use client::{HttpPeerClient, PeerClient};
pub use conflict::{resolve_conflict, Anchor, AnchorClass};
pub use log::FederationLog;
pub use merge::{deterministic_merge, MergeReceipt, MERGE_POLICY};
pub use merkle::{merkle_root_hex, project_root, MerkleProjection};
pub use record::{HmacVerifier, MemoryRecord, NoopVerifier, RecordValidator, RecordVerifier};
pub use sync::{load_peers, PeerConfig, PeerSyncReport, SyncEngine};
