//! Append-only audit trail backed by SQLite (WAL).
//!
//! One logical sequence; appends serialize on the connection mutex but never
//! block the decide hot path (the router awaits the append off the selection
//! critical section).

use crate::audit::validator::{AuditStatus, Violation};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts_ms: i64,
    /// Decision id, or a stage label such as `candidate-filter`.
    pub decision_id: String,
    pub state_key: String,
    pub provider_id: String,
    pub status: AuditStatus,
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_entries: u64,
    pub approved: u64,
    pub rejected: u64,
    pub flagged: u64,
    pub approval_rate: f64,
    pub rejection_rate: f64,
    pub flagged_rate: f64,
    /// Violation kind → occurrence count.
    pub violation_counts: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

impl AuditLog {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open audit db")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory audit db")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_ms INTEGER NOT NULL,
                decision_id TEXT NOT NULL,
                state_key TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                status TEXT NOT NULL,
                violations TEXT NOT NULL,
                note TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_decision ON audit_entries(decision_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_entries(ts_ms DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn append(&self, entry: AuditEntry) -> Result<()> {
        let violations = entry
            .violations
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_entries (ts_ms, decision_id, state_key, provider_id, status, violations, note)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.ts_ms,
                &entry.decision_id,
                &entry.state_key,
                &entry.provider_id,
                entry.status.as_str(),
                violations,
                entry.note.as_deref(),
            ],
        )?;
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let limit = limit.clamp(1, 10_000) as i64;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts_ms, decision_id, state_key, provider_id, status, violations, note
             FROM audit_entries ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn for_decision(&self, decision_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT ts_ms, decision_id, state_key, provider_id, status, violations, note
             FROM audit_entries WHERE decision_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![decision_id], row_to_entry)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub async fn stats(&self) -> Result<AuditStats> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT status, violations, COUNT(*) FROM audit_entries GROUP BY status, violations",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let violations: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            Ok((status, violations, count.max(0) as u64))
        })?;

        let mut total = 0u64;
        let mut approved = 0u64;
        let mut rejected = 0u64;
        let mut flagged = 0u64;
        let mut violation_counts: BTreeMap<String, u64> = BTreeMap::new();
        for r in rows {
            let (status, violations, count) = r?;
            total += count;
            match status.as_str() {
                "approved" => approved += count,
                "rejected" => rejected += count,
                "flagged" => flagged += count,
                _ => {}
            }
            for v in violations.split(',').filter(|v| !v.is_empty()) {
                *violation_counts.entry(v.to_string()).or_default() += count;
            }
        }

        let rate = |n: u64| {
            if total > 0 {
                n as f64 / total as f64
            } else {
                0.0
            }
        };
        Ok(AuditStats {
            total_entries: total,
            approved,
            rejected,
            flagged,
            approval_rate: rate(approved),
            rejection_rate: rate(rejected),
            flagged_rate: rate(flagged),
            violation_counts,
        })
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let status: String = row.get(4)?;
    let violations: String = row.get(5)?;
    Ok(AuditEntry {
        ts_ms: row.get(0)?,
        decision_id: row.get(1)?,
        state_key: row.get(2)?,
        provider_id: row.get(3)?,
        status: parse_status(&status),
        violations: violations
            .split(',')
            .filter(|v| !v.is_empty())
            .filter_map(parse_violation)
            .collect(),
        note: row.get(6)?,
    })
}

fn parse_status(s: &str) -> AuditStatus {
    match s {
        "rejected" => AuditStatus::Rejected,
        "flagged" => AuditStatus::Flagged,
        _ => AuditStatus::Approved,
    }
}

fn parse_violation(s: &str) -> Option<Violation> {
    match s {
        "price" => Some(Violation::Price),
        "latency" => Some(Violation::Latency),
        "reputation" => Some(Violation::Reputation),
        "region" => Some(Violation::Region),
        "accelerator" => Some(Violation::Accelerator),
        "capacity" => Some(Violation::Capacity),
        _ => None,
    }
}
