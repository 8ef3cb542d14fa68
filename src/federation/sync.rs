//! Federation sync engine.
//!
//! For each configured peer: page the remote id list, compute
//! `remote \ local`, then fetch, validate and insert every missing record.
//! Per-id failures are counted and retried on the backoff schedule without
//! aborting the batch. Sync is idempotent: replaying a caught-up peer view
//! is a no-op. Fetches fan out with bounded concurrency inside the sync
//! task, never on ingress threads.

use crate::federation::client::PeerClient;
use crate::federation::log::{FederationLog, InsertOutcome};
use crate::federation::record::RecordValidator;
use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One configured peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct PeersFile {
    #[serde(default)]
    peers: Vec<PeerConfig>,
}

/// Load the peer list from a TOML file with `[[peers]]` entries.
pub fn load_peers(path: &Path) -> Result<Vec<PeerConfig>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read peers file {}", path.display()))?;
    let parsed: PeersFile =
        toml::from_str(&raw).with_context(|| format!("parse peers file {}", path.display()))?;
    Ok(parsed.peers)
}

/// Result of one peer reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerSyncReport {
    pub peer: String,
    pub remote_ids: u64,
    pub missing: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub failed: u64,
}

/// Per-record outcome of one fetch+validate+insert worker.
enum RecordOutcome {
    Inserted,
    Duplicate,
    Conflict,
    Failed,
}

pub struct SyncEngine {
    log: Arc<FederationLog>,
    validator: Arc<RecordValidator>,
    backoff: Vec<Duration>,
    page_size: usize,
    max_workers: usize,
}

impl SyncEngine {
    pub fn new(
        log: Arc<FederationLog>,
        validator: Arc<RecordValidator>,
        backoff_secs: &[u64],
        page_size: usize,
        max_workers: usize,
    ) -> Self {
        Self {
            log,
            validator,
            backoff: backoff_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
            page_size: page_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    /// Reconcile against one peer. Never aborts mid-batch on per-id errors.
    pub async fn sync_peer(
        &self,
        peer_name: &str,
        client: &dyn PeerClient,
    ) -> Result<PeerSyncReport> {
        let mut report = PeerSyncReport {
            peer: peer_name.to_string(),
            ..PeerSyncReport::default()
        };

        // 1) Page the remote id list.
        let mut remote_ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = client
                .list_memory_ids(self.page_size, cursor.as_deref())
                .await
                .with_context(|| format!("listing ids from peer {}", peer_name))?;
            let page_len = page.len();
            cursor = page.last().cloned();
            remote_ids.extend(page);
            if page_len < self.page_size {
                break;
            }
        }
        report.remote_ids = remote_ids.len() as u64;

        // 2) remote \ local
        let missing: Vec<String> = remote_ids
            .into_iter()
            .filter(|id| !self.log.contains(id))
            .collect();
        report.missing = missing.len() as u64;
        if missing.is_empty() {
            debug!(peer = peer_name, "already in sync");
            return Ok(report);
        }
        info!(peer = peer_name, missing = missing.len(), "syncing records");

        // 3) Fetch + validate + insert, fanned out up to max_workers at once.
        let outcomes: Vec<RecordOutcome> = stream::iter(missing)
            .map(|id| async move { self.sync_one(peer_name, client, &id).await })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                RecordOutcome::Inserted => report.inserted += 1,
                RecordOutcome::Duplicate => report.duplicates += 1,
                RecordOutcome::Conflict => report.conflicts += 1,
                RecordOutcome::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn sync_one(
        &self,
        peer_name: &str,
        client: &dyn PeerClient,
        id: &str,
    ) -> RecordOutcome {
        let Some(record) = self.fetch_with_backoff(client, id).await else {
            return RecordOutcome::Failed;
        };
        if let Err(reason) = self.validator.validate(&record) {
            warn!(peer = peer_name, id, reason, "record rejected");
            return RecordOutcome::Failed;
        }
        match self.log.insert(record) {
            Ok(InsertOutcome::Inserted) => RecordOutcome::Inserted,
            Ok(InsertOutcome::Duplicate) => RecordOutcome::Duplicate,
            Ok(InsertOutcome::ConflictResolved { winner_hash }) => {
                warn!(peer = peer_name, id, winner = %winner_hash, "id collision resolved");
                RecordOutcome::Conflict
            }
            Err(e) => {
                warn!(peer = peer_name, id, error = %e, "insert failed");
                RecordOutcome::Failed
            }
        }
    }

    async fn fetch_with_backoff(
        &self,
        client: &dyn PeerClient,
        id: &str,
    ) -> Option<crate::federation::record::MemoryRecord> {
        let mut attempt = 0usize;
        loop {
            match client.get_memory(id).await {
                Ok(record) => return Some(record),
                Err(e) => {
                    if attempt >= self.backoff.len() {
                        warn!(id, error = %e, "fetch failed after retries");
                        return None;
                    }
                    let delay = self.backoff[attempt];
                    debug!(id, attempt, delay_ms = delay.as_millis() as u64, "fetch retry");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
