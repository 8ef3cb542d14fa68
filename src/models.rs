//! Shared domain types for the routing control plane.
//!
//! Everything that crosses more than one component boundary lives here:
//! workload contexts, tenant constraints, policy weights, and observed
//! outcomes. Component-local types stay with their component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Immutable per-request workload description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadContext {
    /// Workload class, e.g. "llm_inference", "llm_training", "rendering".
    pub workload_class: String,
    /// Requested accelerator class, e.g. "a100", "h100", "l40".
    pub accelerator: String,
    /// Requested region, e.g. "us-west".
    pub region: String,
    /// Requested resource-hours for the job.
    #[serde(default = "default_resource_hours")]
    pub resource_hours: f64,
    /// Optional CPU core request (bucketed by the featurizer).
    #[serde(default)]
    pub cpu_cores: Option<u32>,
    /// Optional memory request in GB (bucketed by the featurizer).
    #[serde(default)]
    pub memory_gb: Option<f64>,
}

fn default_resource_hours() -> f64 {
    1.0
}

/// Tenant-supplied hard constraints on candidate providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
    #[serde(default)]
    pub min_reputation: Option<f64>,
    #[serde(default)]
    pub required_region: Option<String>,
    #[serde(default)]
    pub required_accelerator: Option<String>,
}

/// Tenant preference weights over scoring dimensions.
///
/// Carried on the request for audit/replay purposes; the value table learns
/// the actual trade-off from rewards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyWeights {
    pub price: f64,
    pub latency: f64,
    pub reputation: f64,
    pub availability: f64,
}

impl Default for PolicyWeights {
    fn default() -> Self {
        Self {
            price: 0.25,
            latency: 0.25,
            reputation: 0.25,
            availability: 0.25,
        }
    }
}

/// Observed outcome of a dispatched workload, reported via feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub actual_cost: f64,
    pub actual_latency_ms: f64,
    #[serde(default)]
    pub actual_reputation: Option<f64>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl Outcome {
    /// All numeric fields finite. Non-finite outcomes poison the trace and
    /// must never reach the value table.
    pub fn is_finite(&self) -> bool {
        self.actual_cost.is_finite()
            && self.actual_latency_ms.is_finite()
            && self.actual_reputation.map_or(true, |r| r.is_finite())
    }
}

/// How the strategist arrived at an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Explore,
    Exploit,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Exploit => "exploit",
        }
    }
}

/// Reward explanation returned from feedback: per-component breakdown plus a
/// one-line summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardExplanation {
    pub total_reward: f64,
    pub components: BTreeMap<String, f64>,
    pub summary: String,
}
