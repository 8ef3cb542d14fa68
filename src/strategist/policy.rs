//! ε-greedy value-table policy.
//!
//! Recommendation: with probability ε_eff pick a uniformly random candidate
//! (explore), otherwise the argmax of the value table over the candidates
//! (exploit), ties broken toward the lowest provider id. When an adaptive
//! signal is present, ε_eff = clamp(ε · (1 − 0.5·signal), ε_min, 1): a high
//! signal pushes toward exploitation.
//!
//! Update: Q(s,a) ← Q(s,a) + α·(r + γ·max_a' Q(s',a') − Q(s,a)); a missing
//! next state is terminal (future-max term zero). ε decays exactly once per
//! feedback event and is bounded below by ε_min.

use crate::error::RouteError;
use crate::models::SelectionMode;
use crate::strategist::value_table::ValueTable;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Weight of the adaptive signal in the effective-ε computation.
const SIGNAL_EXPLOIT_WEIGHT: f64 = 0.5;

/// Window for the rolling average reward in stats.
const REWARD_WINDOW: usize = 100;

#[derive(Debug, Clone)]
pub struct StrategistConfig {
    /// Learning rate α ∈ (0, 1].
    pub alpha: f64,
    /// Discount factor γ ∈ [0, 1].
    pub gamma: f64,
    /// Base exploration rate ε ∈ [0, 1].
    pub epsilon: f64,
    pub epsilon_min: f64,
    /// Multiplicative ε decay per feedback event.
    pub epsilon_decay: f64,
}

impl Default for StrategistConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            gamma: 0.92,
            epsilon: 0.1,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
        }
    }
}

/// Outcome of a single recommendation.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub provider_id: String,
    pub mode: SelectionMode,
    /// Effective ε used for this decision (after signal scaling).
    pub epsilon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<f64>,
    /// Value-table snapshot for the chosen pair at decision time.
    pub q_value: f64,
    pub decision_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategistStats {
    pub epsilon: f64,
    pub alpha: f64,
    pub gamma: f64,
    pub decision_count: u64,
    pub update_count: u64,
    pub state_count: usize,
    pub pair_count: usize,
    pub avg_reward_recent: f64,
}

/// The Strategist: ε-greedy selection over a shared value table.
pub struct Strategist {
    cfg: StrategistConfig,
    epsilon: RwLock<f64>,
    table: ValueTable,
    rng: Mutex<ChaCha8Rng>,
    decision_count: AtomicU64,
    update_count: AtomicU64,
    recent_rewards: Mutex<VecDeque<f64>>,
}

impl Strategist {
    pub fn new(cfg: StrategistConfig) -> Self {
        Self::with_rng(cfg, ChaCha8Rng::from_entropy())
    }

    /// Deterministic construction for tests and replay.
    pub fn with_seed(cfg: StrategistConfig, seed: u64) -> Self {
        Self::with_rng(cfg, ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(cfg: StrategistConfig, rng: ChaCha8Rng) -> Self {
        let epsilon = cfg.epsilon;
        Self {
            cfg,
            epsilon: RwLock::new(epsilon),
            table: ValueTable::new(),
            rng: Mutex::new(rng),
            decision_count: AtomicU64::new(0),
            update_count: AtomicU64::new(0),
            recent_rewards: Mutex::new(VecDeque::with_capacity(REWARD_WINDOW)),
        }
    }

    pub fn table(&self) -> &ValueTable {
        &self.table
    }

    pub fn epsilon(&self) -> f64 {
        *self.epsilon.read()
    }

    /// Restore ε (snapshot load).
    pub fn set_epsilon(&self, epsilon: f64) {
        *self.epsilon.write() = epsilon.clamp(self.cfg.epsilon_min, 1.0);
    }

    pub fn config(&self) -> &StrategistConfig {
        &self.cfg
    }

    /// Effective ε for one decision given the optional adaptive signal.
    fn effective_epsilon(&self, signal: Option<f64>) -> f64 {
        let base = *self.epsilon.read();
        match signal {
            Some(s) if s.is_finite() => {
                let s = s.clamp(0.0, 1.0);
                (base * (1.0 - SIGNAL_EXPLOIT_WEIGHT * s)).clamp(self.cfg.epsilon_min, 1.0)
            }
            _ => base,
        }
    }

    /// ε-greedy recommendation over the candidate set.
    ///
    /// The action space is request-scoped: candidates unseen by the table
    /// score exactly zero.
    pub fn recommend(
        &self,
        state_key: &str,
        candidates: &[String],
        signal: Option<f64>,
    ) -> Result<Recommendation, RouteError> {
        if candidates.is_empty() {
            return Err(RouteError::NoViableProviders);
        }

        let epsilon = self.effective_epsilon(signal);
        let (provider_id, mode) = {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < epsilon {
                let idx = rng.gen_range(0..candidates.len());
                (candidates[idx].clone(), SelectionMode::Explore)
            } else {
                let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
                let (best, _) = self
                    .table
                    .best_action(state_key, &refs)
                    .expect("non-empty candidates");
                (best.to_string(), SelectionMode::Exploit)
            }
        };

        let q_value = self.table.value(state_key, &provider_id);
        let decision_count = self.decision_count.fetch_add(1, Ordering::Relaxed) + 1;

        Ok(Recommendation {
            provider_id,
            mode,
            epsilon,
            signal,
            q_value,
            decision_count,
        })
    }

    /// Temporal-difference update for one observed reward. Returns the new
    /// value. Non-finite rewards are rejected without touching the table.
    pub fn update(
        &self,
        state_key: &str,
        provider_id: &str,
        reward: f64,
        next_state: Option<&str>,
    ) -> Result<f64, RouteError> {
        if !reward.is_finite() {
            return Err(RouteError::InvalidInput(format!(
                "non-finite reward for decision on {}",
                provider_id
            )));
        }

        let max_future = next_state.map(|s| self.table.max_value(s)).unwrap_or(0.0);
        let alpha = self.cfg.alpha;
        let gamma = self.cfg.gamma;
        let new_q = self.table.update(state_key, provider_id, |q| {
            q + alpha * (reward + gamma * max_future - q)
        });

        self.update_count.fetch_add(1, Ordering::Relaxed);
        let mut window = self.recent_rewards.lock();
        if window.len() == REWARD_WINDOW {
            window.pop_front();
        }
        window.push_back(reward);

        Ok(new_q)
    }

    /// Decay ε once; called exactly once per feedback event.
    pub fn decay_epsilon(&self) {
        let mut eps = self.epsilon.write();
        *eps = (*eps * self.cfg.epsilon_decay).max(self.cfg.epsilon_min);
    }

    pub fn stats(&self) -> StrategistStats {
        let window = self.recent_rewards.lock();
        let avg = if window.is_empty() {
            0.0
        } else {
            window.iter().sum::<f64>() / window.len() as f64
        };
        StrategistStats {
            epsilon: *self.epsilon.read(),
            alpha: self.cfg.alpha,
            gamma: self.cfg.gamma,
            decision_count: self.decision_count.load(Ordering::Relaxed),
            update_count: self.update_count.load(Ordering::Relaxed),
            state_count: self.table.state_count(),
            pair_count: self.table.pair_count(),
            avg_reward_recent: avg,
        }
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cands(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn zero_epsilon() -> StrategistConfig {
        StrategistConfig {
            epsilon: 0.0,
            epsilon_min: 0.0,
            ..StrategistConfig::default()
        }
    }

    #[test]
    fn test_empty_candidates_is_terminal() {
        let s = Strategist::with_seed(StrategistConfig::default(), 1);
        let err = s.recommend("s", &[], None).unwrap_err();
        assert_eq!(err.kind(), "no_viable_providers");
    }

    #[test]
    fn test_exploit_path_exact_update() {
        // Two constraint-identical providers; one carries value 1.0; ε = 0.
        let s = Strategist::with_seed(zero_epsilon(), 7);
        s.table().update("s", "akash", |_| 1.0);

        let rec = s.recommend("s", &cands(&["akash", "vast"]), None).unwrap();
        assert_eq!(rec.provider_id, "akash");
        assert_eq!(rec.mode, SelectionMode::Exploit);
        assert_eq!(rec.q_value, 1.0);

        // reward +1, terminal: new value = 1 + α·(1 − 1) = 1 exactly
        let new_q = s.update("s", "akash", 1.0, None).unwrap();
        assert_eq!(new_q, 1.0);
    }

    #[test]
    fn test_explore_path_seeded_rng_repeats() {
        let cfg = StrategistConfig {
            epsilon: 1.0,
            ..StrategistConfig::default()
        };
        let pick = |seed: u64| {
            let s = Strategist::with_seed(cfg.clone(), seed);
            s.recommend("s", &cands(&["a", "b", "c", "d"]), None)
                .unwrap()
        };
        let first = pick(42);
        let second = pick(42);
        assert_eq!(first.provider_id, second.provider_id);
        assert_eq!(first.mode, SelectionMode::Explore);
    }

    #[test]
    fn test_signal_scales_epsilon_toward_exploitation() {
        let s = Strategist::with_seed(StrategistConfig::default(), 3);
        assert_eq!(s.effective_epsilon(None), 0.1);
        let scaled = s.effective_epsilon(Some(1.0));
        assert!((scaled - 0.05).abs() < 1e-12);
        // Clamped below by epsilon_min
        let tight = Strategist::with_seed(
            StrategistConfig {
                epsilon: 0.011,
                ..StrategistConfig::default()
            },
            3,
        );
        assert_eq!(tight.effective_epsilon(Some(1.0)), 0.01);
    }

    #[test]
    fn test_decay_monotone_and_bounded() {
        let s = Strategist::with_seed(StrategistConfig::default(), 9);
        let mut prev = s.epsilon();
        for _ in 0..2000 {
            s.decay_epsilon();
            let eps = s.epsilon();
            assert!(eps <= prev);
            assert!(eps >= s.config().epsilon_min);
            prev = eps;
        }
        assert_eq!(s.epsilon(), s.config().epsilon_min);
    }

    #[test]
    fn test_nan_reward_rejected_table_untouched() {
        let s = Strategist::with_seed(StrategistConfig::default(), 5);
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = s.update("s", "a", bad, None).unwrap_err();
            assert_eq!(err.kind(), "invalid_input");
        }
        assert_eq!(s.table().value("s", "a"), 0.0);
        assert_eq!(s.table().pair_count(), 0);
        assert_eq!(s.update_count(), 0);
    }

    #[test]
    fn test_update_with_next_state_discounts_future() {
        let cfg = StrategistConfig {
            alpha: 0.5,
            gamma: 0.5,
            ..zero_epsilon()
        };
        let s = Strategist::with_seed(cfg, 11);
        s.table().update("next", "x", |_| 2.0);
        // q = 0 + 0.5·(1 + 0.5·2 − 0) = 1.0
        let q = s.update("s", "a", 1.0, Some("next")).unwrap();
        assert_eq!(q, 1.0);
    }

    #[test]
    fn test_new_provider_appears_as_fresh_zero_entry() {
        let s = Strategist::with_seed(zero_epsilon(), 13);
        s.table().update("s", "old", |_| -1.0);
        // New provider "fresh" reads 0.0 > -1.0 and wins exploitation
        let rec = s.recommend("s", &cands(&["old", "fresh"]), None).unwrap();
        assert_eq!(rec.provider_id, "fresh");
        assert_eq!(rec.q_value, 0.0);
    }
}
