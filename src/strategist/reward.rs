//! Reward function.
//!
//! reward = success_term + cost_term + latency_term + reputation_term
//!
//! Calibration: the failure penalty (−20) dominates the success bonus (+10)
//! so one failed dispatch outweighs several cheap successes. The latency term
//! is normalized against a 500 ms reference and clipped at −1; reputation is
//! normalized against the 0-100 scale. The function is pure and, for finite
//! inputs, always finite.

use crate::models::{Outcome, RewardExplanation};
use std::collections::BTreeMap;

pub const SUCCESS_BONUS: f64 = 10.0;
pub const FAILURE_PENALTY: f64 = -20.0;
pub const LATENCY_REF_MS: f64 = 500.0;
pub const REPUTATION_MAX: f64 = 100.0;

/// Scalar reward for an observed outcome. Callers must validate finiteness
/// of the outcome first (non-finite outcomes poison the trace instead).
pub fn compute_reward(outcome: &Outcome) -> f64 {
    if !outcome.success {
        return FAILURE_PENALTY;
    }

    let cost_term = -outcome.actual_cost;
    let latency_term = -(outcome.actual_latency_ms / LATENCY_REF_MS).min(1.0);
    let reputation_term = outcome
        .actual_reputation
        .map(|r| r / REPUTATION_MAX)
        .unwrap_or(0.0);

    SUCCESS_BONUS + cost_term + latency_term + reputation_term
}

/// Component breakdown plus a one-line summary for the feedback response.
pub fn explain_reward(outcome: &Outcome, reward: f64) -> RewardExplanation {
    let mut components = BTreeMap::new();

    if outcome.success {
        components.insert("success_term".to_string(), SUCCESS_BONUS);
        components.insert("cost_term".to_string(), -outcome.actual_cost);
        components.insert(
            "latency_term".to_string(),
            -(outcome.actual_latency_ms / LATENCY_REF_MS).min(1.0),
        );
        components.insert(
            "reputation_term".to_string(),
            outcome
                .actual_reputation
                .map(|r| r / REPUTATION_MAX)
                .unwrap_or(0.0),
        );
    } else {
        components.insert("success_term".to_string(), FAILURE_PENALTY);
    }

    let summary = if !outcome.success {
        match &outcome.error_reason {
            Some(reason) => format!("dispatch failed: {}", reason),
            None => "dispatch failed".to_string(),
        }
    } else if reward > SUCCESS_BONUS - 1.0 {
        "excellent outcome: low cost and latency".to_string()
    } else if reward > 0.0 {
        "good outcome: met most objectives".to_string()
    } else {
        "marginal outcome: cost or latency dominated".to_string()
    };

    RewardExplanation {
        total_reward: reward,
        components,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(cost: f64, latency_ms: f64, rep: Option<f64>) -> Outcome {
        Outcome {
            success: true,
            actual_cost: cost,
            actual_latency_ms: latency_ms,
            actual_reputation: rep,
            error_reason: None,
        }
    }

    #[test]
    fn test_failure_is_flat_penalty() {
        let o = Outcome {
            success: false,
            actual_cost: 0.1,
            actual_latency_ms: 10.0,
            actual_reputation: Some(99.0),
            error_reason: Some("timeout".into()),
        };
        assert_eq!(compute_reward(&o), FAILURE_PENALTY);
    }

    #[test]
    fn test_one_failure_dominates_several_successes() {
        let good = compute_reward(&success(1.0, 100.0, Some(90.0)));
        assert!(FAILURE_PENALTY.abs() > good);
        assert!(FAILURE_PENALTY + good < 0.0);
    }

    #[test]
    fn test_latency_term_clipped_at_minus_one() {
        let near = compute_reward(&success(0.0, 500.0, None));
        let far = compute_reward(&success(0.0, 50_000.0, None));
        assert_eq!(near, far);
        assert_eq!(far, SUCCESS_BONUS - 1.0);
    }

    #[test]
    fn test_missing_reputation_contributes_zero() {
        let with_rep = compute_reward(&success(2.0, 100.0, Some(100.0)));
        let without = compute_reward(&success(2.0, 100.0, None));
        assert!((with_rep - without - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reward_is_finite_for_finite_inputs() {
        let r = compute_reward(&success(1e9, 1e12, Some(100.0)));
        assert!(r.is_finite());
    }

    #[test]
    fn test_explanation_components_sum_to_reward() {
        let o = success(1.5, 250.0, Some(80.0));
        let r = compute_reward(&o);
        let ex = explain_reward(&o, r);
        let sum: f64 = ex.components.values().sum();
        assert!((sum - r).abs() < 1e-12);
        assert_eq!(ex.total_reward, r);
    }
}
