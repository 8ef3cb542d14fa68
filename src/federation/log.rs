//! Append-only federation log.
//!
//! Frame layout per entry: `u32 len || record_json || sha256(record_json)`.
//! A torn or corrupt tail is truncated on open; surviving entries keep their
//! append order. The in-memory index is keyed by record id; an id collision
//! with different content resolves to the lexicographically smaller content
//! hash (the deterministic-merge rule), and the losing insert surfaces as a
//! conflict.

use crate::error::RouteError;
use crate::federation::merkle::project_root;
use crate::federation::record::MemoryRecord;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAX_RECORD_LEN: usize = 4 * 1024 * 1024;

/// Result of inserting a record.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same id, same content: a no-op, sync stays idempotent.
    Duplicate,
    /// Same id, different content; the returned hash won.
    ConflictResolved { winner_hash: String },
}

struct Inner {
    file: File,
    index: HashMap<String, MemoryRecord>,
    order: Vec<String>,
}

pub struct FederationLog {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FederationLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create federation log dir {}", parent.display()))?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open federation log {}", path.display()))?;

        let mut index = HashMap::new();
        let mut order = Vec::new();

        let mut reader = BufReader::new(File::open(path)?);
        let mut good_end: u64 = 0;
        loop {
            match read_entry(&mut reader)? {
                Entry::Record(bytes) => {
                    let record: MemoryRecord = serde_json::from_slice(&bytes)
                        .map_err(|e| RouteError::Corruption(format!("undecodable federation record: {}", e)))?;
                    good_end += 4 + bytes.len() as u64 + 32;
                    // Replay follows the same id-collision rule as insert():
                    // the lexicographically smaller content hash wins, so a
                    // conflict resolved before a restart stays resolved.
                    match index.get(&record.id) {
                        None => {
                            order.push(record.id.clone());
                            index.insert(record.id.clone(), record);
                        }
                        Some(existing) => {
                            if record.content_hash() < existing.content_hash() {
                                index.insert(record.id.clone(), record);
                            }
                        }
                    }
                }
                Entry::Eof => break,
                Entry::CorruptTail => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = good_end,
                        "federation log: truncating torn tail"
                    );
                    file.set_len(good_end)?;
                    break;
                }
            }
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner { file, index, order }),
        })
    }

    /// Insert a record, keyed by id. Identical content is a no-op; an id
    /// collision with different content keeps the smaller content hash.
    pub fn insert(&self, record: MemoryRecord) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.index.get(&record.id) {
            let existing_hash = existing.content_hash();
            let incoming_hash = record.content_hash();
            if existing_hash == incoming_hash {
                return Ok(InsertOutcome::Duplicate);
            }
            if incoming_hash < existing_hash {
                // The incoming record wins; append it and repoint the index.
                append_entry(&mut inner.file, &record)?;
                let id = record.id.clone();
                inner.index.insert(id, record);
                return Ok(InsertOutcome::ConflictResolved {
                    winner_hash: incoming_hash,
                });
            }
            return Ok(InsertOutcome::ConflictResolved {
                winner_hash: existing_hash,
            });
        }

        append_entry(&mut inner.file, &record)?;
        inner.order.push(record.id.clone());
        inner.index.insert(record.id.clone(), record);
        Ok(InsertOutcome::Inserted)
    }

    pub fn get(&self, id: &str) -> Option<MemoryRecord> {
        self.inner.lock().index.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().index.contains_key(id)
    }

    /// Ids in stable (timestamp, id) order, paged by an optional `after`
    /// cursor.
    pub fn list_ids(&self, limit: usize, after: Option<&str>) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keyed: Vec<(&String, &String)> = inner
            .index
            .values()
            .map(|r| (&r.timestamp, &r.id))
            .collect();
        keyed.sort();
        let start = match after {
            Some(cursor) => keyed
                .iter()
                .position(|(_, id)| id.as_str() == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        keyed
            .into_iter()
            .skip(start)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// All records in append order.
    pub fn all(&self) -> Vec<MemoryRecord> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.index.get(id))
            .cloned()
            .collect()
    }

    /// Merkle root over the append-ordered projection.
    pub fn root(&self) -> String {
        project_root(&self.all())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_entry(file: &mut File, record: &MemoryRecord) -> Result<()> {
    let bytes = serde_json::to_vec(record)?;
    let digest = Sha256::digest(&bytes);
    file.write_all(&(bytes.len() as u32).to_le_bytes())?;
    file.write_all(&bytes)?;
    file.write_all(&digest)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

enum Entry {
    Record(Vec<u8>),
    Eof,
    CorruptTail,
}

fn read_entry<R: Read>(r: &mut R) -> Result<Entry> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Entry::Eof),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_RECORD_LEN {
        return Ok(Entry::CorruptTail);
    }
    let mut payload = vec![0u8; len];
    if r.read_exact(&mut payload).is_err() {
        return Ok(Entry::CorruptTail);
    }
    let mut digest = [0u8; 32];
    if r.read_exact(&mut digest).is_err() {
        return Ok(Entry::CorruptTail);
    }
    if Sha256::digest(&payload).as_slice() != digest {
        return Ok(Entry::CorruptTail);
    }
    Ok(Entry::Record(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: &str, ts: &str, payload: &str) -> MemoryRecord {
        let mut r = MemoryRecord::new(
            "event",
            "test",
            "1",
            serde_json::json!({ "payload": payload }),
        );
        r.id = id.to_string();
        r.timestamp = ts.to_string();
        r
    }

    #[test]
    fn test_insert_get_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let log = FederationLog::open(&dir.path().join("fed.log")).unwrap();
        let r = rec("m1", "2026-01-01T00:00:00Z", "x");

        assert_eq!(log.insert(r.clone()).unwrap(), InsertOutcome::Inserted);
        assert_eq!(log.insert(r.clone()).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(log.len(), 1);
        assert_eq!(log.get("m1").unwrap().data, r.data);
    }

    #[test]
    fn test_id_collision_keeps_smaller_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let log = FederationLog::open(&dir.path().join("fed.log")).unwrap();
        let a = rec("m1", "2026-01-01T00:00:00Z", "aaa");
        let b = rec("m1", "2026-01-02T00:00:00Z", "bbb");
        let winner_hash = a.content_hash().min(b.content_hash());

        log.insert(a.clone()).unwrap();
        match log.insert(b.clone()).unwrap() {
            InsertOutcome::ConflictResolved { winner_hash: w } => assert_eq!(w, winner_hash),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(log.get("m1").unwrap().content_hash(), winner_hash);
    }

    #[test]
    fn test_conflict_winner_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fed.log");
        let a = rec("m1", "2026-01-01T00:00:00Z", "aaa");
        let b = rec("m1", "2026-01-02T00:00:00Z", "bbb");
        // Insert the larger hash first so the incoming record wins and the
        // on-disk order is [loser, winner].
        let (loser, winner) = if a.content_hash() < b.content_hash() {
            (b, a)
        } else {
            (a, b)
        };
        let winner_hash = winner.content_hash();

        let root_before = {
            let log = FederationLog::open(&path).unwrap();
            log.insert(loser).unwrap();
            match log.insert(winner).unwrap() {
                InsertOutcome::ConflictResolved { winner_hash: w } => {
                    assert_eq!(w, winner_hash)
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(log.get("m1").unwrap().content_hash(), winner_hash);
            log.root()
        };

        let log = FederationLog::open(&path).unwrap();
        assert_eq!(log.get("m1").unwrap().content_hash(), winner_hash);
        assert_eq!(log.root(), root_before);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_survives_restart_and_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fed.log");
        {
            let log = FederationLog::open(&path).unwrap();
            log.insert(rec("m1", "2026-01-01T00:00:00Z", "a")).unwrap();
            log.insert(rec("m2", "2026-01-02T00:00:00Z", "b")).unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 7).unwrap();

        let log = FederationLog::open(&path).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.contains("m1"));
        assert!(!log.contains("m2"));
    }

    #[test]
    fn test_list_ids_stable_sort_and_paging() {
        let dir = tempfile::tempdir().unwrap();
        let log = FederationLog::open(&dir.path().join("fed.log")).unwrap();
        log.insert(rec("b", "2026-01-02T00:00:00Z", "2")).unwrap();
        log.insert(rec("a", "2026-01-01T00:00:00Z", "1")).unwrap();
        log.insert(rec("c", "2026-01-01T00:00:00Z", "3")).unwrap();

        // Sorted by (timestamp, id)
        assert_eq!(log.list_ids(10, None), vec!["a", "c", "b"]);
        assert_eq!(log.list_ids(2, None), vec!["a", "c"]);
        assert_eq!(log.list_ids(10, Some("c")), vec!["b"]);
        assert!(log.list_ids(10, Some("b")).is_empty());
    }

    #[test]
    fn test_root_reflects_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = FederationLog::open(&dir.path().join("fed.log")).unwrap();
        let empty_root = log.root();
        log.insert(rec("m1", "2026-01-01T00:00:00Z", "a")).unwrap();
        assert_ne!(log.root(), empty_root);
    }

    #[test]
    fn test_bitflip_detected_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fed.log");
        {
            let log = FederationLog::open(&path).unwrap();
            log.insert(rec("m1", "2026-01-01T00:00:00Z", "a")).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let log = FederationLog::open(&path).unwrap();
        assert_eq!(log.len(), 0);
    }
}
