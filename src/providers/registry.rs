//! Provider Directory
//!
//! Holds the mutable provider fleet. Base attributes are combined with
//! dynamic overlays (latency spikes, price shocks, capacity surges,
//! reputation drops) into effective values, clamped into physical ranges.
//!
//! Overlays are written by a single background controller; `decide` acquires
//! one immutable fleet snapshot at entry and never re-reads mid-decision.
//! The per-step capacity ledger is tracked separately so reservations do not
//! churn the fleet snapshot.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Fallback hourly price for an accelerator class a provider did not quote.
const DEFAULT_PRICE_PER_HOUR: f64 = 10.0;

/// Base provider record, as loaded from the fleet file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub regions: Vec<String>,
    pub accelerators: Vec<String>,
    /// Hourly price per accelerator class, USD.
    pub price_per_hour: BTreeMap<String, f64>,
    /// Hourly credit burn per accelerator class.
    #[serde(default)]
    pub credits_per_hour: BTreeMap<String, f64>,
    pub base_latency_ms: f64,
    /// GPU-hours dispatchable per step.
    pub capacity_per_step: f64,
    /// Reputation score in [0, 100].
    pub reputation: f64,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Dispatch endpoint for the executor.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_active() -> bool {
    true
}

/// Dynamic overlay applied on top of base attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Overlay {
    #[serde(default)]
    pub latency_delta_ms: f64,
    #[serde(default = "one")]
    pub capacity_multiplier: f64,
    #[serde(default = "one")]
    pub price_multiplier: f64,
    #[serde(default)]
    pub reputation_delta: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for Overlay {
    fn default() -> Self {
        Self {
            latency_delta_ms: 0.0,
            capacity_multiplier: 1.0,
            price_multiplier: 1.0,
            reputation_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    base: Provider,
    overlay: Overlay,
}

impl ProviderEntry {
    fn effective_latency_ms(&self) -> f64 {
        (self.base.base_latency_ms + self.overlay.latency_delta_ms).max(1.0)
    }

    fn effective_capacity(&self) -> f64 {
        (self.base.capacity_per_step * self.overlay.capacity_multiplier).max(0.0)
    }

    fn effective_price(&self, accelerator: &str) -> f64 {
        let base = self
            .base
            .price_per_hour
            .get(accelerator)
            .copied()
            .unwrap_or(DEFAULT_PRICE_PER_HOUR);
        base * self.overlay.price_multiplier
    }

    fn effective_reputation(&self) -> f64 {
        (self.base.reputation + self.overlay.reputation_delta).clamp(0.0, 100.0)
    }
}

/// Immutable effective view of one provider, consistent for the duration of a
/// single `decide` call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderView {
    pub id: String,
    pub regions: Vec<String>,
    pub accelerators: Vec<String>,
    pub latency_ms: f64,
    pub reputation: f64,
    pub capacity: f64,
    pub capacity_remaining: f64,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    price_per_hour: BTreeMap<String, f64>,
    credits_per_hour: BTreeMap<String, f64>,
}

impl ProviderView {
    pub fn price_for(&self, accelerator: &str) -> f64 {
        self.price_per_hour
            .get(accelerator)
            .copied()
            .unwrap_or(DEFAULT_PRICE_PER_HOUR)
    }

    pub fn credits_for(&self, accelerator: &str) -> f64 {
        self.credits_per_hour
            .get(accelerator)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn supports_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r == region || r == "global")
    }

    pub fn supports_accelerator(&self, accelerator: &str) -> bool {
        self.accelerators.iter().any(|a| a == accelerator)
    }
}

#[derive(Default)]
struct Fleet {
    providers: BTreeMap<String, ProviderEntry>,
}

/// The provider fleet with overlay support and a per-step capacity ledger.
pub struct ProviderDirectory {
    fleet: ArcSwap<Fleet>,
    remaining: RwLock<HashMap<String, f64>>,
}

impl ProviderDirectory {
    pub fn new(providers: Vec<Provider>) -> Self {
        let mut map = BTreeMap::new();
        let mut remaining = HashMap::new();
        for p in providers {
            remaining.insert(p.id.clone(), p.capacity_per_step);
            map.insert(
                p.id.clone(),
                ProviderEntry {
                    base: p,
                    overlay: Overlay::default(),
                },
            );
        }
        Self {
            fleet: ArcSwap::from_pointee(Fleet { providers: map }),
            remaining: RwLock::new(remaining),
        }
    }

    /// Load the fleet from a JSON array file.
    pub fn load_file(path: &Path) -> Result<Vec<Provider>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read providers file {}", path.display()))?;
        let providers: Vec<Provider> = serde_json::from_str(&raw)
            .with_context(|| format!("parse providers file {}", path.display()))?;
        Ok(providers)
    }

    /// One consistent effective snapshot of the whole fleet.
    pub fn snapshot(&self) -> Vec<ProviderView> {
        let fleet = self.fleet.load();
        let remaining = self.remaining.read();
        fleet
            .providers
            .values()
            .map(|e| self.view_of(e, &remaining))
            .collect()
    }

    /// Effective views for a specific candidate id list, in request order.
    /// Unknown ids are dropped.
    pub fn views_for(&self, ids: &[String]) -> Vec<ProviderView> {
        let fleet = self.fleet.load();
        let remaining = self.remaining.read();
        ids.iter()
            .filter_map(|id| fleet.providers.get(id))
            .map(|e| self.view_of(e, &remaining))
            .collect()
    }

    fn view_of(&self, entry: &ProviderEntry, remaining: &HashMap<String, f64>) -> ProviderView {
        let capacity = entry.effective_capacity();
        // Invariant: capacity_remaining <= effective_capacity within a step.
        let rem = remaining
            .get(&entry.base.id)
            .copied()
            .unwrap_or(capacity)
            .min(capacity);
        let price_per_hour = entry
            .base
            .price_per_hour
            .iter()
            .map(|(k, v)| (k.clone(), v * entry.overlay.price_multiplier))
            .collect();
        ProviderView {
            id: entry.base.id.clone(),
            regions: entry.base.regions.clone(),
            accelerators: entry.base.accelerators.clone(),
            latency_ms: entry.effective_latency_ms(),
            reputation: entry.effective_reputation(),
            capacity,
            capacity_remaining: rem,
            active: entry.base.active,
            endpoint: entry.base.endpoint.clone(),
            price_per_hour,
            credits_per_hour: entry.base.credits_per_hour.clone(),
        }
    }

    /// Insert or replace a provider. New providers start with full capacity
    /// and a neutral overlay.
    pub fn upsert(&self, provider: Provider) {
        self.mutate(|fleet| {
            self.remaining
                .write()
                .entry(provider.id.clone())
                .or_insert(provider.capacity_per_step);
            let overlay = fleet
                .providers
                .get(&provider.id)
                .map(|e| e.overlay.clone())
                .unwrap_or_default();
            fleet.providers.insert(
                provider.id.clone(),
                ProviderEntry {
                    base: provider,
                    overlay,
                },
            );
        });
    }

    /// Replace a provider's overlay (background controller only).
    pub fn set_overlay(&self, id: &str, overlay: Overlay) -> bool {
        let mut found = false;
        self.mutate(|fleet| {
            if let Some(entry) = fleet.providers.get_mut(id) {
                entry.overlay = overlay.clone();
                found = true;
            }
        });
        found
    }

    /// Toggle a provider (outage / recovery).
    pub fn set_active(&self, id: &str, active: bool) -> bool {
        let mut found = false;
        self.mutate(|fleet| {
            if let Some(entry) = fleet.providers.get_mut(id) {
                entry.base.active = active;
                found = true;
            }
        });
        found
    }

    /// Reserve resource-hours against the per-step ledger. Returns false when
    /// the remaining capacity cannot cover the request.
    pub fn reserve(&self, id: &str, hours: f64) -> bool {
        let fleet = self.fleet.load();
        let Some(entry) = fleet.providers.get(id) else {
            return false;
        };
        let cap = entry.effective_capacity();
        let mut remaining = self.remaining.write();
        let slot = remaining.entry(id.to_string()).or_insert(cap);
        *slot = slot.min(cap);
        if *slot < hours {
            return false;
        }
        *slot -= hours;
        true
    }

    /// Refresh the per-step capacity ledger to effective capacity. The
    /// refresh cadence belongs to the embedding process.
    pub fn reset_step(&self) {
        let fleet = self.fleet.load();
        let mut remaining = self.remaining.write();
        for (id, entry) in &fleet.providers {
            remaining.insert(id.clone(), entry.effective_capacity());
        }
    }

    pub fn len(&self) -> usize {
        self.fleet.load().providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Copy-on-write swap; single background writer assumed.
    fn mutate<F: FnOnce(&mut Fleet)>(&self, f: F) {
        let current = self.fleet.load_full();
        let mut next = Fleet {
            providers: current.providers.clone(),
        };
        f(&mut next);
        self.fleet.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(id: &str) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_string(),
            regions: vec!["us-west".into(), "eu-central".into()],
            accelerators: vec!["a100".into(), "h100".into()],
            price_per_hour: [("a100".to_string(), 2.0)].into_iter().collect(),
            credits_per_hour: BTreeMap::new(),
            base_latency_ms: 50.0,
            capacity_per_step: 100.0,
            reputation: 90.0,
            active: true,
            endpoint: None,
        }
    }

    #[test]
    fn test_effective_values_clamped() {
        let dir = ProviderDirectory::new(vec![provider("akash")]);
        dir.set_overlay(
            "akash",
            Overlay {
                latency_delta_ms: -200.0,
                capacity_multiplier: 0.0,
                price_multiplier: 2.0,
                reputation_delta: 50.0,
            },
        );
        let views = dir.snapshot();
        assert_eq!(views.len(), 1);
        let v = &views[0];
        assert_eq!(v.latency_ms, 1.0);
        assert_eq!(v.capacity, 0.0);
        assert_eq!(v.price_for("a100"), 4.0);
        assert_eq!(v.reputation, 100.0);
    }

    #[test]
    fn test_remaining_never_exceeds_effective_capacity() {
        let dir = ProviderDirectory::new(vec![provider("vast")]);
        // Shrink capacity below the initial remaining ledger
        dir.set_overlay(
            "vast",
            Overlay {
                capacity_multiplier: 0.1,
                ..Overlay::default()
            },
        );
        let v = &dir.snapshot()[0];
        assert!(v.capacity_remaining <= v.capacity);
        assert_eq!(v.capacity_remaining, 10.0);
    }

    #[test]
    fn test_reserve_and_reset_step() {
        let dir = ProviderDirectory::new(vec![provider("ionet")]);
        assert!(dir.reserve("ionet", 60.0));
        assert!(!dir.reserve("ionet", 60.0));
        dir.reset_step();
        assert!(dir.reserve("ionet", 60.0));
        assert!(!dir.reserve("missing", 1.0));
    }

    #[test]
    fn test_views_for_drops_unknown_ids() {
        let dir = ProviderDirectory::new(vec![provider("akash"), provider("vast")]);
        let views = dir.views_for(&["vast".to_string(), "ghost".to_string()]);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].id, "vast");
    }

    #[test]
    fn test_unquoted_accelerator_uses_default_price() {
        let dir = ProviderDirectory::new(vec![provider("akash")]);
        let v = &dir.snapshot()[0];
        assert_eq!(v.price_for("h100"), DEFAULT_PRICE_PER_HOUR);
    }
}
