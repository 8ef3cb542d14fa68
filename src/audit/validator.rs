//! Constraint validation against provider effective state.
//!
//! Each candidate is checked independently against the tenant constraints;
//! the violation set is produced in a fixed order (price, latency,
//! reputation, region, accelerator, capacity) so audit entries are
//! deterministic. Strict mode rejects violating candidates outright;
//! permissive mode flags them but leaves them in the pool.

use crate::audit::log::{AuditEntry, AuditLog};
use crate::models::{Constraints, WorkloadContext};
use crate::providers::ProviderView;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stage label for candidate-filter validations; the final entry for a
/// decision carries the real decision id.
pub const FILTER_STAGE: &str = "candidate-filter";

/// Constraint violation kinds, in canonical set order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    Price,
    Latency,
    Reputation,
    Region,
    Accelerator,
    Capacity,
}

impl Violation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Latency => "latency",
            Self::Reputation => "reputation",
            Self::Region => "region",
            Self::Accelerator => "accelerator",
            Self::Capacity => "capacity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Approved,
    Flagged,
    Rejected,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Flagged => "flagged",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditMode {
    Strict,
    Permissive,
}

/// Independent checks in canonical order. Inactive providers count as a
/// capacity violation (nothing dispatchable).
pub fn check_candidate(
    provider: &ProviderView,
    context: &WorkloadContext,
    constraints: &Constraints,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    let accelerator = constraints
        .required_accelerator
        .as_deref()
        .unwrap_or(&context.accelerator);
    let region = constraints
        .required_region
        .as_deref()
        .unwrap_or(&context.region);

    if let Some(max_price) = constraints.max_price {
        if provider.price_for(accelerator) > max_price {
            violations.push(Violation::Price);
        }
    }
    if let Some(max_latency) = constraints.max_latency_ms {
        if provider.latency_ms > max_latency {
            violations.push(Violation::Latency);
        }
    }
    if let Some(min_reputation) = constraints.min_reputation {
        if provider.reputation < min_reputation {
            violations.push(Violation::Reputation);
        }
    }
    if !provider.supports_region(region) {
        violations.push(Violation::Region);
    }
    if !provider.supports_accelerator(accelerator) {
        violations.push(Violation::Accelerator);
    }
    if !provider.active || provider.capacity_remaining < context.resource_hours {
        violations.push(Violation::Capacity);
    }

    violations
}

/// The Auditor: applies mode policy and appends audit entries.
pub struct Validator {
    mode: AuditMode,
    log: Arc<AuditLog>,
}

impl Validator {
    pub fn new(mode: AuditMode, log: Arc<AuditLog>) -> Self {
        Self { mode, log }
    }

    pub fn mode(&self) -> AuditMode {
        self.mode
    }

    pub fn log(&self) -> &Arc<AuditLog> {
        &self.log
    }

    /// Validate one candidate and append an audit entry under `stage` (the
    /// decision id for the final entry, [`FILTER_STAGE`] during filtering).
    ///
    /// Returns the status and the violation set. A rejected candidate must
    /// be removed from the pool by the caller.
    pub async fn validate(
        &self,
        stage: &str,
        state_key: &str,
        provider: &ProviderView,
        context: &WorkloadContext,
        constraints: &Constraints,
    ) -> Result<(AuditStatus, Vec<Violation>)> {
        let violations = check_candidate(provider, context, constraints);
        let status = if violations.is_empty() {
            AuditStatus::Approved
        } else if self.mode == AuditMode::Strict {
            AuditStatus::Rejected
        } else {
            AuditStatus::Flagged
        };

        self.log
            .append(AuditEntry {
                ts_ms: chrono::Utc::now().timestamp_millis(),
                decision_id: stage.to_string(),
                state_key: state_key.to_string(),
                provider_id: provider.id.clone(),
                status,
                violations: violations.clone(),
                note: None,
            })
            .await?;

        Ok((status, violations))
    }

    /// Record an anomaly note without changing any status.
    pub async fn flag_anomaly(
        &self,
        decision_id: &str,
        state_key: &str,
        provider_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.log
            .append(AuditEntry {
                ts_ms: chrono::Utc::now().timestamp_millis(),
                decision_id: decision_id.to_string(),
                state_key: state_key.to_string(),
                provider_id: provider_id.to_string(),
                status: AuditStatus::Flagged,
                violations: Vec::new(),
                note: Some(format!("ANOMALY: {}", reason)),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{Provider, ProviderDirectory};
    use std::collections::BTreeMap;

    fn view(price: f64, latency: f64, reputation: f64, capacity: f64) -> ProviderView {
        let dir = ProviderDirectory::new(vec![Provider {
            id: "akash".into(),
            name: "akash".into(),
            regions: vec!["us-west".into()],
            accelerators: vec!["a100".into()],
            price_per_hour: [("a100".to_string(), price)].into_iter().collect(),
            credits_per_hour: BTreeMap::new(),
            base_latency_ms: latency,
            capacity_per_step: capacity,
            reputation,
            active: true,
            endpoint: None,
        }]);
        dir.snapshot().remove(0)
    }

    fn ctx() -> WorkloadContext {
        WorkloadContext {
            workload_class: "llm_inference".into(),
            accelerator: "a100".into(),
            region: "us-west".into(),
            resource_hours: 2.0,
            cpu_cores: None,
            memory_gb: None,
        }
    }

    #[test]
    fn test_no_violations_for_compliant_candidate() {
        let constraints = Constraints {
            max_price: Some(3.0),
            max_latency_ms: Some(100.0),
            min_reputation: Some(80.0),
            ..Constraints::default()
        };
        let v = check_candidate(&view(2.0, 50.0, 90.0, 10.0), &ctx(), &constraints);
        assert!(v.is_empty());
    }

    #[test]
    fn test_price_ceiling_violation() {
        let constraints = Constraints {
            max_price: Some(1.5),
            ..Constraints::default()
        };
        let v = check_candidate(&view(2.0, 50.0, 90.0, 10.0), &ctx(), &constraints);
        assert_eq!(v, vec![Violation::Price]);
    }

    #[test]
    fn test_violation_set_order_is_canonical() {
        let constraints = Constraints {
            max_price: Some(0.5),
            max_latency_ms: Some(10.0),
            min_reputation: Some(99.0),
            required_region: Some("ap-south".into()),
            required_accelerator: Some("h100".into()),
            ..Constraints::default()
        };
        let mut context = ctx();
        context.resource_hours = 1_000.0;
        let v = check_candidate(&view(2.0, 50.0, 90.0, 10.0), &context, &constraints);
        assert_eq!(
            v,
            vec![
                Violation::Price,
                Violation::Latency,
                Violation::Reputation,
                Violation::Region,
                Violation::Accelerator,
                Violation::Capacity,
            ]
        );
    }

    #[test]
    fn test_unset_constraints_do_not_fire() {
        // Only region/accelerator/capacity are always checked
        let v = check_candidate(&view(999.0, 9_999.0, 1.0, 10.0), &ctx(), &Constraints::default());
        assert!(v.is_empty());
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_permissive_flags() {
        let log = Arc::new(AuditLog::open_in_memory().unwrap());
        let constraints = Constraints {
            max_price: Some(1.0),
            ..Constraints::default()
        };

        let strict = Validator::new(AuditMode::Strict, log.clone());
        let (status, violations) = strict
            .validate(FILTER_STAGE, "sk", &view(2.0, 50.0, 90.0, 10.0), &ctx(), &constraints)
            .await
            .unwrap();
        assert_eq!(status, AuditStatus::Rejected);
        assert_eq!(violations, vec![Violation::Price]);

        let permissive = Validator::new(AuditMode::Permissive, log.clone());
        let (status, _) = permissive
            .validate(FILTER_STAGE, "sk", &view(2.0, 50.0, 90.0, 10.0), &ctx(), &constraints)
            .await
            .unwrap();
        assert_eq!(status, AuditStatus::Flagged);

        let entries = log.recent(10).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
