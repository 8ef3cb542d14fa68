//! Sparse double-indexed value table.
//!
//! Outer map: state key → per-state row; each row carries its own lock so a
//! read-modify-write on one (state, action) pair never blocks updates on
//! other states. The value of an unseen pair is exactly 0.0 and plain reads
//! never materialize entries.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct StateRow {
    values: RwLock<HashMap<String, f64>>,
}

/// Sparse (state → action → value) table with per-state locking.
#[derive(Default)]
pub struct ValueTable {
    states: RwLock<HashMap<String, Arc<StateRow>>>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for a (state, action) pair; 0.0 for unseen pairs. Never
    /// materializes entries.
    pub fn value(&self, state: &str, action: &str) -> f64 {
        let states = self.states.read();
        match states.get(state) {
            Some(row) => row.values.read().get(action).copied().unwrap_or(0.0),
            None => 0.0,
        }
    }

    /// Maximum value over all known actions in `state`; 0.0 when the state is
    /// unknown or has no entries.
    pub fn max_value(&self, state: &str) -> f64 {
        let states = self.states.read();
        match states.get(state) {
            Some(row) => {
                let values = row.values.read();
                if values.is_empty() {
                    0.0
                } else {
                    values.values().copied().fold(f64::NEG_INFINITY, f64::max)
                }
            }
            None => 0.0,
        }
    }

    /// Argmax over the given candidates (unseen pairs score 0.0). Ties break
    /// toward the lowest action id, so the result is independent of candidate
    /// order.
    pub fn best_action<'a>(&self, state: &str, candidates: &[&'a str]) -> Option<(&'a str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for &action in candidates {
            let v = self.value(state, action);
            best = match best {
                None => Some((action, v)),
                Some((b_id, b_v)) => {
                    if v > b_v || (v == b_v && action < b_id) {
                        Some((action, v))
                    } else {
                        Some((b_id, b_v))
                    }
                }
            };
        }
        best
    }

    /// Atomic read-modify-write on one (state, action) slot. Returns the new
    /// value. Concurrent updates on the same pair serialize on the row lock.
    pub fn update<F: FnOnce(f64) -> f64>(&self, state: &str, action: &str, f: F) -> f64 {
        let row = {
            let states = self.states.read();
            states.get(state).cloned()
        };
        let row = match row {
            Some(row) => row,
            None => {
                let mut states = self.states.write();
                states
                    .entry(state.to_string())
                    .or_insert_with(|| Arc::new(StateRow::default()))
                    .clone()
            }
        };
        let mut values = row.values.write();
        let slot = values.entry(action.to_string()).or_insert(0.0);
        *slot = f(*slot);
        *slot
    }

    pub fn state_count(&self) -> usize {
        self.states.read().len()
    }

    pub fn pair_count(&self) -> usize {
        self.states
            .read()
            .values()
            .map(|row| row.values.read().len())
            .sum()
    }

    /// Sorted export for canonical snapshots.
    pub fn export(&self) -> BTreeMap<String, BTreeMap<String, f64>> {
        self.states
            .read()
            .iter()
            .map(|(state, row)| {
                let inner = row
                    .values
                    .read()
                    .iter()
                    .map(|(a, v)| (a.clone(), *v))
                    .collect();
                (state.clone(), inner)
            })
            .collect()
    }

    /// Replace the table contents from a snapshot export.
    pub fn import(&self, data: BTreeMap<String, BTreeMap<String, f64>>) {
        let mut states = self.states.write();
        states.clear();
        for (state, actions) in data {
            let row = StateRow {
                values: RwLock::new(actions.into_iter().collect()),
            };
            states.insert(state, Arc::new(row));
        }
    }
}
