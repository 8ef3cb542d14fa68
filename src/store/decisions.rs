//! Decision store.
//!
//! A durable map decision-id → (state, action, context, outcome, reward) with
//! a secondary append-only log for iteration by time. Storage is a single
//! framed file (header + length-prefixed, CRC-checksummed JSON records); the
//! in-memory index is rebuilt on open. Recovery drops a torn tail and never
//! re-orders surviving records.
//!
//! Write-once semantics: a trace is created once; only the outcome tail may
//! be written, exactly once (compare-and-set on `outcome is null`). Traces
//! are never deleted except through the explicit retention API.

use crate::error::RouteError;
use crate::models::{Outcome, SelectionMode, WorkloadContext};
use crate::store::framing::{self, Frame, Header};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const STORE_MAGIC: [u8; 4] = *b"GRDS";
const SCHEMA_VERSION: u32 = 1;
/// Upper bound for a single framed record; larger lengths indicate a torn
/// length prefix.
const MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

/// Dispatch result recorded on the trace by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub accepted: bool,
    #[serde(default)]
    pub completion_handle: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    pub dispatch_latency_ms: f64,
}

/// Lifecycle of a decision trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Pending,
    Finalized,
    Poisoned,
    Abandoned,
}

/// One decision trace. Immutable once written except for the outcome tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub decision_id: String,
    pub ts_ms: i64,
    pub tenant: String,
    pub state_key: String,
    pub provider_id: String,
    pub epsilon: f64,
    pub mode: SelectionMode,
    #[serde(default)]
    pub signal: Option<f64>,
    pub q_value: f64,
    pub context: WorkloadContext,
    #[serde(default)]
    pub dispatch: Option<DispatchRecord>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub reward: Option<f64>,
    #[serde(default = "default_status")]
    pub status: TraceStatus,
}

fn default_status() -> TraceStatus {
    TraceStatus::Pending
}

/// Append-only log record kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LogRecord {
    Created { trace: DecisionTrace },
    Dispatched { decision_id: String, record: DispatchRecord },
    Finalized { decision_id: String, ts_ms: i64, outcome: Outcome, reward: f64 },
    Poisoned { decision_id: String, ts_ms: i64, reason: String },
    Abandoned { decision_id: String, ts_ms: i64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total_traces: u64,
    pub finalized: u64,
    pub poisoned: u64,
    pub abandoned: u64,
    pub pending: u64,
    pub feedback_rate: f64,
}

struct Inner {
    file: File,
    index: HashMap<String, DecisionTrace>,
    /// Append order of decision ids, preserved across recovery.
    order: Vec<String>,
}

/// Thread-safe decision store; single logical writer per decision id.
pub struct DecisionStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DecisionStore {
    /// Open or create the store, replaying the log into the index. A corrupt
    /// header fails closed; a corrupt tail is truncated away.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create store dir {}", parent.display()))?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open decision store {}", path.display()))?;

        let file_len = file.metadata()?.len();
        let mut index = HashMap::new();
        let mut order = Vec::new();

        if file_len == 0 {
            Header::new(STORE_MAGIC, SCHEMA_VERSION).write_to(&mut file)?;
            file.flush()?;
        } else {
            let mut reader = BufReader::new(File::open(path)?);
            let header = Header::read_from(&mut reader, STORE_MAGIC)?;
            let header = header.ok_or_else(|| {
                RouteError::Corruption(format!("bad store header in {}", path.display()))
            })?;
            if header.version != SCHEMA_VERSION {
                return Err(RouteError::Corruption(format!(
                    "unsupported store schema version {}",
                    header.version
                ))
                .into());
            }

            let mut good_end = Header::LEN;
            loop {
                match framing::read_frame(&mut reader, MAX_RECORD_LEN)? {
                    Frame::Record(payload) => {
                        match serde_json::from_slice::<LogRecord>(&payload) {
                            Ok(record) => apply_record(&mut index, &mut order, record),
                            // Undecodable but checksum-valid payload: schema
                            // drift, fail closed.
                            Err(e) => {
                                return Err(RouteError::Corruption(format!(
                                    "undecodable store record: {}",
                                    e
                                ))
                                .into())
                            }
                        }
                        good_end += framing::frame_len(payload.len());
                    }
                    Frame::Eof => break,
                    Frame::CorruptTail => {
                        tracing::warn!(
                            path = %path.display(),
                            offset = good_end,
                            "decision store: truncating torn tail"
                        );
                        file.set_len(good_end)?;
                        break;
                    }
                }
            }
            file.seek(SeekFrom::End(0))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, index, order }),
        })
    }

    fn append(inner: &mut Inner, record: &LogRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        framing::write_frame(&mut inner.file, &payload)?;
        inner.file.flush()?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Create a trace. The id must be fresh.
    pub fn create(&self, trace: DecisionTrace) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.index.contains_key(&trace.decision_id) {
            return Err(RouteError::InvalidInput(format!(
                "duplicate decision id {}",
                trace.decision_id
            ))
            .into());
        }
        let record = LogRecord::Created { trace: trace.clone() };
        Self::append(&mut inner, &record)?;
        inner.order.push(trace.decision_id.clone());
        inner.index.insert(trace.decision_id.clone(), trace);
        Ok(())
    }

    /// Attach the executor's dispatch record to a pending trace.
    pub fn record_dispatch(&self, decision_id: &str, record: DispatchRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.index.contains_key(decision_id) {
            return Err(RouteError::UnknownDecision(decision_id.to_string()).into());
        }
        Self::append(
            &mut inner,
            &LogRecord::Dispatched {
                decision_id: decision_id.to_string(),
                record: record.clone(),
            },
        )?;
        if let Some(trace) = inner.index.get_mut(decision_id) {
            trace.dispatch = Some(record);
        }
        Ok(())
    }

    /// Compare-and-set the outcome tail. Exactly one finalize per trace
    /// succeeds; a second attempt reports the prior reward.
    pub fn finalize(
        &self,
        decision_id: &str,
        outcome: Outcome,
        reward: f64,
    ) -> std::result::Result<(), RouteError> {
        let mut inner = self.inner.lock();
        let trace = inner
            .index
            .get(decision_id)
            .ok_or_else(|| RouteError::UnknownDecision(decision_id.to_string()))?;

        match trace.status {
            TraceStatus::Finalized => {
                return Err(RouteError::AlreadyFinalized {
                    decision_id: decision_id.to_string(),
                    reward: trace.reward.unwrap_or(0.0),
                })
            }
            TraceStatus::Poisoned | TraceStatus::Abandoned => {
                return Err(RouteError::InvalidInput(format!(
                    "decision {} is {:?} and accepts no feedback",
                    decision_id, trace.status
                )))
            }
            TraceStatus::Pending => {}
        }

        let ts_ms = chrono::Utc::now().timestamp_millis();
        Self::append(
            &mut inner,
            &LogRecord::Finalized {
                decision_id: decision_id.to_string(),
                ts_ms,
                outcome: outcome.clone(),
                reward,
            },
        )
        .map_err(|e| RouteError::Corruption(format!("finalize write failed: {}", e)))?;

        let trace = inner.index.get_mut(decision_id).expect("checked above");
        trace.outcome = Some(outcome);
        trace.reward = Some(reward);
        trace.status = TraceStatus::Finalized;
        Ok(())
    }

    /// Mark a trace poisoned (non-finite outcome); no further feedback.
    pub fn mark_poisoned(&self, decision_id: &str, reason: &str) -> Result<()> {
        self.mark(decision_id, TraceStatus::Poisoned, Some(reason))
    }

    /// Mark a persisted-but-not-dispatched trace abandoned; no feedback is
    /// accepted for it.
    pub fn mark_abandoned(&self, decision_id: &str) -> Result<()> {
        self.mark(decision_id, TraceStatus::Abandoned, None)
    }

    fn mark(&self, decision_id: &str, status: TraceStatus, reason: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        let trace = inner
            .index
            .get(decision_id)
            .ok_or_else(|| RouteError::UnknownDecision(decision_id.to_string()))?;
        if trace.status != TraceStatus::Pending {
            return Err(RouteError::InvalidInput(format!(
                "decision {} is not pending",
                decision_id
            ))
            .into());
        }
        let ts_ms = chrono::Utc::now().timestamp_millis();
        let record = match status {
            TraceStatus::Poisoned => LogRecord::Poisoned {
                decision_id: decision_id.to_string(),
                ts_ms,
                reason: reason.unwrap_or("").to_string(),
            },
            TraceStatus::Abandoned => LogRecord::Abandoned {
                decision_id: decision_id.to_string(),
                ts_ms,
            },
            _ => unreachable!("mark() only poisons or abandons"),
        };
        Self::append(&mut inner, &record)?;
        if let Some(trace) = inner.index.get_mut(decision_id) {
            trace.status = status;
        }
        Ok(())
    }

    pub fn get(&self, decision_id: &str) -> Option<DecisionTrace> {
        self.inner.lock().index.get(decision_id).cloned()
    }

    /// Traces whose creation timestamp falls in `[from_ms, to_ms)`, in append
    /// order.
    pub fn scan_range(&self, from_ms: i64, to_ms: i64) -> Vec<DecisionTrace> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.index.get(id))
            .filter(|t| t.ts_ms >= from_ms && t.ts_ms < to_ms)
            .cloned()
            .collect()
    }

    /// All traces for one tenant, in append order.
    pub fn scan_tenant(&self, tenant: &str) -> Vec<DecisionTrace> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.index.get(id))
            .filter(|t| t.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Explicit retention: drop traces created before `cutoff_ms` and compact
    /// the log. Returns the number purged.
    pub fn purge_before(&self, cutoff_ms: i64) -> Result<usize> {
        let mut inner = self.inner.lock();
        let keep: Vec<String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .index
                    .get(*id)
                    .map(|t| t.ts_ms >= cutoff_ms)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let purged = inner.order.len() - keep.len();
        if purged == 0 {
            return Ok(0);
        }

        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            Header::new(STORE_MAGIC, SCHEMA_VERSION).write_to(&mut tmp)?;
            for id in &keep {
                let trace = inner.index.get(id).expect("kept ids are indexed");
                let payload = serde_json::to_vec(&LogRecord::Created {
                    trace: trace.clone(),
                })?;
                framing::write_frame(&mut tmp, &payload)?;
            }
            tmp.flush()?;
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        inner.file = OpenOptions::new().append(true).read(true).open(&self.path)?;
        inner.index.retain(|id, _| keep.iter().any(|k| k == id));
        inner.order = keep;
        Ok(purged)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        let total = inner.index.len() as u64;
        let mut finalized = 0u64;
        let mut poisoned = 0u64;
        let mut abandoned = 0u64;
        for t in inner.index.values() {
            match t.status {
                TraceStatus::Finalized => finalized += 1,
                TraceStatus::Poisoned => poisoned += 1,
                TraceStatus::Abandoned => abandoned += 1,
                TraceStatus::Pending => {}
            }
        }
        StoreStats {
            total_traces: total,
            finalized,
            poisoned,
            abandoned,
            pending: total - finalized - poisoned - abandoned,
            feedback_rate: if total > 0 {
                finalized as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn apply_record(
    index: &mut HashMap<String, DecisionTrace>,
    order: &mut Vec<String>,
    record: LogRecord,
) {
    match record {
        LogRecord::Created { trace } => {
            if !index.contains_key(&trace.decision_id) {
                order.push(trace.decision_id.clone());
                index.insert(trace.decision_id.clone(), trace);
            }
        }
        LogRecord::Dispatched {
            decision_id,
            record,
        } => {
            if let Some(trace) = index.get_mut(&decision_id) {
                trace.dispatch = Some(record);
            }
        }
        LogRecord::Finalized {
            decision_id,
            outcome,
            reward,
            ..
        } => {
            if let Some(trace) = index.get_mut(&decision_id) {
                if trace.status == TraceStatus::Pending {
                    trace.outcome = Some(outcome);
                    trace.reward = Some(reward);
                    trace.status = TraceStatus::Finalized;
                }
            }
        }
        LogRecord::Poisoned { decision_id, .. } => {
            if let Some(trace) = index.get_mut(&decision_id) {
                trace.status = TraceStatus::Poisoned;
            }
        }
        LogRecord::Abandoned { decision_id, .. } => {
            if let Some(trace) = index.get_mut(&decision_id) {
                trace.status = TraceStatus::Abandoned;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(id: &str, tenant: &str, ts_ms: i64) -> DecisionTrace {
        DecisionTrace {
            decision_id: id.to_string(),
            ts_ms,
            tenant: tenant.to_string(),
            state_key: "llm_inference|a100|us-west|4|16|<50|none".to_string(),
            provider_id: "akash".to_string(),
            epsilon: 0.1,
            mode: SelectionMode::Exploit,
            signal: None,
            q_value: 0.0,
            context: WorkloadContext {
                workload_class: "llm_inference".into(),
                accelerator: "a100".into(),
                region: "us-west".into(),
                resource_hours: 1.0,
                cpu_cores: None,
                memory_gb: None,
            },
            dispatch: None,
            outcome: None,
            reward: None,
            status: TraceStatus::Pending,
        }
    }

    fn outcome(success: bool) -> Outcome {
        Outcome {
            success,
            actual_cost: 1.0,
            actual_latency_ms: 100.0,
            actual_reputation: None,
            error_reason: None,
        }
    }

    #[test]
    fn test_create_get_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decisions.log");
        let store = DecisionStore::open(&path).unwrap();

        store.create(trace("d1", "acme", 100)).unwrap();
        assert!(store.get("d1").is_some());

        store.finalize("d1", outcome(true), 9.0).unwrap();
        let t = store.get("d1").unwrap();
        assert_eq!(t.reward, Some(9.0));
        assert_eq!(t.status, TraceStatus::Finalized);
    }

    #[test]
    fn test_second_finalize_returns_prior_reward() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(&dir.path().join("d.log")).unwrap();
        store.create(trace("d1", "acme", 100)).unwrap();
        store.finalize("d1", outcome(true), 7.5).unwrap();

        let err = store.finalize("d1", outcome(false), -20.0).unwrap_err();
        match err {
            RouteError::AlreadyFinalized { reward, .. } => assert_eq!(reward, 7.5),
            other => panic!("unexpected {:?}", other),
        }
        // Tail unchanged
        assert_eq!(store.get("d1").unwrap().reward, Some(7.5));
    }

    #[test]
    fn test_unknown_decision() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(&dir.path().join("d.log")).unwrap();
        let err = store.finalize("ghost", outcome(true), 1.0).unwrap_err();
        assert_eq!(err.kind(), "unknown_decision");
    }

    #[test]
    fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        {
            let store = DecisionStore::open(&path).unwrap();
            store.create(trace("d1", "acme", 100)).unwrap();
            store.create(trace("d2", "acme", 200)).unwrap();
            store.finalize("d1", outcome(true), 3.0).unwrap();
        }
        let store = DecisionStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("d1").unwrap().reward, Some(3.0));
        assert_eq!(store.get("d2").unwrap().status, TraceStatus::Pending);
    }

    #[test]
    fn test_recovery_truncates_torn_tail_preserving_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        {
            let store = DecisionStore::open(&path).unwrap();
            store.create(trace("d1", "acme", 100)).unwrap();
            store.create(trace("d2", "acme", 200)).unwrap();
        }
        // Tear the last record
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 5).unwrap();

        let store = DecisionStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        let scanned = store.scan_range(0, i64::MAX);
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].decision_id, "d1");

        // The store accepts new writes after recovery
        store.create(trace("d3", "acme", 300)).unwrap();
        drop(store);
        let store = DecisionStore::open(&path).unwrap();
        let ids: Vec<_> = store
            .scan_range(0, i64::MAX)
            .into_iter()
            .map(|t| t.decision_id)
            .collect();
        assert_eq!(ids, vec!["d1", "d3"]);
    }

    #[test]
    fn test_corrupt_header_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        {
            DecisionStore::open(&path).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[1] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
        assert!(DecisionStore::open(&path).is_err());
    }

    #[test]
    fn test_scans_by_time_and_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(&dir.path().join("d.log")).unwrap();
        store.create(trace("d1", "acme", 100)).unwrap();
        store.create(trace("d2", "globex", 200)).unwrap();
        store.create(trace("d3", "acme", 300)).unwrap();

        let ranged = store.scan_range(150, 301);
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged[0].decision_id, "d2");

        let acme = store.scan_tenant("acme");
        assert_eq!(acme.len(), 2);
        assert_eq!(acme[1].decision_id, "d3");
    }

    #[test]
    fn test_abandoned_accepts_no_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(&dir.path().join("d.log")).unwrap();
        store.create(trace("d1", "acme", 100)).unwrap();
        store.mark_abandoned("d1").unwrap();
        let err = store.finalize("d1", outcome(true), 1.0).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_poisoned_blocks_feedback_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        {
            let store = DecisionStore::open(&path).unwrap();
            store.create(trace("d1", "acme", 100)).unwrap();
            store.mark_poisoned("d1", "non-finite outcome").unwrap();
        }
        let store = DecisionStore::open(&path).unwrap();
        assert_eq!(store.get("d1").unwrap().status, TraceStatus::Poisoned);
        assert!(store.finalize("d1", outcome(true), 1.0).is_err());
    }

    #[test]
    fn test_purge_before_is_explicit_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.log");
        let store = DecisionStore::open(&path).unwrap();
        store.create(trace("d1", "acme", 100)).unwrap();
        store.create(trace("d2", "acme", 200)).unwrap();
        store.create(trace("d3", "acme", 300)).unwrap();

        let purged = store.purge_before(250).unwrap();
        assert_eq!(purged, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("d3").is_some());

        // Compacted file reloads cleanly
        drop(store);
        let store = DecisionStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(&dir.path().join("d.log")).unwrap();
        store.create(trace("d1", "acme", 100)).unwrap();
        store.create(trace("d2", "acme", 200)).unwrap();
        store.finalize("d1", outcome(true), 1.0).unwrap();
        let stats = store.stats();
        assert_eq!(stats.total_traces, 2);
        assert_eq!(stats.finalized, 1);
        assert_eq!(stats.pending, 1);
        assert!((stats.feedback_rate - 0.5).abs() < 1e-12);
    }
}
