//! Content-addressed value-table snapshots.
//!
//! A snapshot is a canonical JSON document: hyperparameters first, then the
//! sparse state → action → value map with keys sorted lexicographically.
//! Files are named by the SHA-256 of their bytes (`qtable-<digest16>.json`)
//! with a `latest` pointer file; a digest mismatch on load is a corruption
//! error. Serialize → load → serialize yields byte-identical output.

use crate::error::RouteError;
use crate::strategist::policy::{Strategist, StrategistConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const LATEST_POINTER: &str = "latest";

/// Hyperparameters serialized ahead of the table, matching load-time
/// reconstruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hyperparameters {
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub hyperparameters: Hyperparameters,
    pub values: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Snapshot {
    pub fn capture(strategist: &Strategist) -> Self {
        let cfg = strategist.config();
        Self {
            hyperparameters: Hyperparameters {
                alpha: cfg.alpha,
                gamma: cfg.gamma,
                epsilon: strategist.epsilon(),
                epsilon_min: cfg.epsilon_min,
                epsilon_decay: cfg.epsilon_decay,
            },
            values: strategist.table().export(),
        }
    }

    /// Canonical bytes: serde_json with sorted map keys, no extraneous
    /// whitespace.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("snapshot serialization is infallible")
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    /// Write the snapshot into `dir` under its content address and move the
    /// `latest` pointer. Returns the snapshot file path.
    pub fn save_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
        let bytes = self.canonical_bytes();
        let digest = hex::encode(Sha256::digest(&bytes));
        let file_name = format!("qtable-{}.json", &digest[..16]);
        let path = dir.join(&file_name);
        std::fs::write(&path, &bytes)
            .with_context(|| format!("write snapshot {}", path.display()))?;
        std::fs::write(dir.join(LATEST_POINTER), file_name.as_bytes())
            .with_context(|| "write latest pointer")?;
        Ok(path)
    }

    /// Load a snapshot file, verifying its content address when the file name
    /// carries one.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read snapshot {}", path.display()))?;
        let digest = hex::encode(Sha256::digest(&bytes));

        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(expected) = name
                .strip_prefix("qtable-")
                .and_then(|rest| rest.strip_suffix(".json"))
            {
                if !digest.starts_with(expected) {
                    return Err(RouteError::Corruption(format!(
                        "snapshot digest mismatch for {}",
                        path.display()
                    ))
                    .into());
                }
            }
        }

        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse snapshot {}", path.display()))?;
        Ok(snapshot)
    }

    /// Follow the `latest` pointer in `dir`. Returns None when no snapshot
    /// has been written yet.
    pub fn load_latest(dir: &Path) -> Result<Option<Self>> {
        let pointer = dir.join(LATEST_POINTER);
        if !pointer.exists() {
            return Ok(None);
        }
        let name = std::fs::read_to_string(&pointer).with_context(|| "read latest pointer")?;
        let path = dir.join(name.trim());
        Ok(Some(Self::load(&path)?))
    }

    /// Reconstruct a strategist that behaves identically to the one captured.
    pub fn restore(&self, seed: Option<u64>) -> Strategist {
        let cfg = StrategistConfig {
            alpha: self.hyperparameters.alpha,
            gamma: self.hyperparameters.gamma,
            epsilon: self.hyperparameters.epsilon,
            epsilon_min: self.hyperparameters.epsilon_min,
            epsilon_decay: self.hyperparameters.epsilon_decay,
        };
        let strategist = match seed {
            Some(seed) => Strategist::with_seed(cfg, seed),
            None => Strategist::new(cfg),
        };
        strategist.set_epsilon(self.hyperparameters.epsilon);
        strategist.table().import(self.values.clone());
        strategist
    }

    /// Apply this snapshot onto an existing strategist (table + ε).
    pub fn apply(&self, strategist: &Strategist) {
        strategist.set_epsilon(self.hyperparameters.epsilon);
        strategist.table().import(self.values.clone());
    }
}
