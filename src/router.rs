//! Router core: the decision-execution-feedback triad.
//!
//! `decide` fans a request through signal sampling, featurization, constraint
//! filtering, the optional policy gate, ε-greedy selection, dispatch, and
//! trace persistence. `feedback` closes the loop: reward computation,
//! the compare-and-set outcome tail, the value-table update, ε decay, and
//! folding the finalized trace into the federation log.
//!
//! All components are explicit values threaded through the core; tests
//! inject fakes without global state. Ingress backpressure is a bounded
//! permit pool per operation; overflow fast-fails with a typed error.

use crate::audit::validator::FILTER_STAGE;
use crate::audit::{AuditStatus, Validator};
use crate::error::RouteError;
use crate::executor::{DispatchRequest, ProviderDispatcher};
use crate::federation::{FederationLog, MemoryRecord, RecordVerifier};
use crate::models::{Constraints, Outcome, PolicyWeights, RewardExplanation, WorkloadContext};
use crate::policyhost::{PolicyHost, PolicyInput};
use crate::providers::{ProviderDirectory, ProviderView};
use crate::signal::SignalSource;
use crate::store::{DecisionStore, DecisionTrace, DispatchRecord, TraceStatus};
use crate::strategist::{compute_reward, explain_reward, featurize, Strategist};
use crate::telemetry::{GaugeSnapshot, RouterMetrics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Absolute value-table jump that triggers an anomaly note.
const ANOMALY_Q_JUMP: f64 = 15.0;

#[derive(Debug, Clone, Deserialize)]
pub struct DecideRequest {
    pub tenant: String,
    pub context: WorkloadContext,
    /// Candidate provider ids; empty means the whole fleet.
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub weights: Option<PolicyWeights>,
    /// Caller-supplied adaptive signal override (mostly for replay); when
    /// absent the signal source is sampled.
    #[serde(default)]
    pub signal: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecideMetadata {
    pub state_key: String,
    pub mode: &'static str,
    pub epsilon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<f64>,
    pub q_value: f64,
    pub decision_count: u64,
    pub dispatch_accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecideResponse {
    pub decision_id: String,
    pub provider: String,
    pub metadata: DecideMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResponse {
    pub reward: f64,
    pub explanation: RewardExplanation,
    pub q_updates: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_seconds: u64,
    pub strategist: crate::strategist::StrategistStats,
    pub store: crate::store::StoreStats,
    pub audit: crate::audit::AuditStats,
    pub signal: crate::signal::SignalStats,
    pub providers: usize,
    pub federation_records: usize,
    pub federation_root: String,
}

pub struct RouterCoreConfig {
    pub node_id: String,
    pub dispatch_timeout: Duration,
    pub snapshot_dir: std::path::PathBuf,
    pub snapshot_every: u64,
    pub max_inflight_decisions: usize,
    pub max_inflight_feedback: usize,
}

pub struct RouterCore {
    cfg: RouterCoreConfig,
    strategist: Arc<Strategist>,
    validator: Arc<Validator>,
    providers: Arc<ProviderDirectory>,
    store: Arc<DecisionStore>,
    signal: Arc<SignalSource>,
    dispatcher: Arc<dyn ProviderDispatcher>,
    policy: Option<Arc<PolicyHost>>,
    federation: Arc<FederationLog>,
    verifier: Arc<dyn RecordVerifier>,
    metrics: Arc<RouterMetrics>,
    decide_permits: Semaphore,
    feedback_permits: Semaphore,
    started: Instant,
}

impl RouterCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: RouterCoreConfig,
        strategist: Arc<Strategist>,
        validator: Arc<Validator>,
        providers: Arc<ProviderDirectory>,
        store: Arc<DecisionStore>,
        signal: Arc<SignalSource>,
        dispatcher: Arc<dyn ProviderDispatcher>,
        policy: Option<Arc<PolicyHost>>,
        federation: Arc<FederationLog>,
        verifier: Arc<dyn RecordVerifier>,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        let decide_permits = Semaphore::new(cfg.max_inflight_decisions.max(1));
        let feedback_permits = Semaphore::new(cfg.max_inflight_feedback.max(1));
        Self {
            cfg,
            strategist,
            validator,
            providers,
            store,
            signal,
            dispatcher,
            policy,
            federation,
            verifier,
            metrics,
            decide_permits,
            feedback_permits,
            started: Instant::now(),
        }
    }

    pub fn metrics(&self) -> &Arc<RouterMetrics> {
        &self.metrics
    }

    pub fn strategist(&self) -> &Arc<Strategist> {
        &self.strategist
    }

    pub fn store(&self) -> &Arc<DecisionStore> {
        &self.store
    }

    pub fn federation(&self) -> &Arc<FederationLog> {
        &self.federation
    }

    pub fn providers(&self) -> &Arc<ProviderDirectory> {
        &self.providers
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    pub fn snapshot_dir(&self) -> &std::path::Path {
        &self.cfg.snapshot_dir
    }

    /// One routing decision, end to end.
    pub async fn decide(&self, request: DecideRequest) -> Result<DecideResponse, RouteError> {
        let _permit = self
            .decide_permits
            .try_acquire()
            .map_err(|_| {
                self.metrics.bump_overloaded();
                RouteError::Overloaded("decide")
            })?;
        let start = Instant::now();

        validate_request(&request)?;

        // Suspension point (a): the adaptive-signal RPC.
        let signal = match request.signal {
            Some(s) if s.is_finite() => Some(s.clamp(0.0, 1.0)),
            Some(_) => None,
            None => self.signal.sample().await,
        };

        let state_key = featurize(&request.context, &request.constraints, signal);

        // One consistent fleet snapshot for the whole decision.
        let views = if request.candidates.is_empty() {
            self.providers.snapshot()
        } else {
            self.providers.views_for(&request.candidates)
        };

        // Constraint filter: rejected candidates leave the pool.
        let mut pool: Vec<ProviderView> = Vec::with_capacity(views.len());
        for view in views {
            let (status, _violations) = self
                .validator
                .validate(FILTER_STAGE, &state_key, &view, &request.context, &request.constraints)
                .await
                .map_err(internal)?;
            if status != AuditStatus::Rejected {
                pool.push(view);
            }
        }
        if pool.is_empty() {
            self.metrics.bump_no_viable();
            return Err(RouteError::NoViableProviders);
        }

        // Optional hard gate, before any value-table consultation.
        if let Some(policy) = &self.policy {
            let verdict = policy
                .authorize(&PolicyInput {
                    treaty: serde_json::json!({
                        "tenant": request.tenant,
                        "constraints": request.constraints,
                        "weights": request.weights.clone().unwrap_or_default(),
                    }),
                    order: serde_json::json!({
                        "context": request.context,
                        "candidates": pool.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
                    }),
                    acc: serde_json::json!({
                        "decisions": self.strategist.stats().decision_count,
                    }),
                })
                .await;
            if !verdict.allow {
                self.metrics.bump_policy_reject();
                return Err(RouteError::PolicyReject(verdict.reason));
            }
        }

        let candidate_ids: Vec<String> = pool.iter().map(|p| p.id.clone()).collect();
        let recommendation = self.strategist.recommend(&state_key, &candidate_ids, signal)?;
        let chosen = pool
            .iter()
            .find(|p| p.id == recommendation.provider_id)
            .expect("recommendation comes from the pool")
            .clone();

        if !self.providers.reserve(&chosen.id, request.context.resource_hours) {
            // Filter checked capacity against the same snapshot; a parallel
            // decision may have drained it since.
            warn!(provider = %chosen.id, "capacity drained between filter and reserve");
        }

        let decision_id = uuid::Uuid::new_v4().to_string();

        // Exactly one audit entry carries the real decision id.
        self.validator
            .validate(&decision_id, &state_key, &chosen, &request.context, &request.constraints)
            .await
            .map_err(internal)?;

        let trace = DecisionTrace {
            decision_id: decision_id.clone(),
            ts_ms: chrono::Utc::now().timestamp_millis(),
            tenant: request.tenant.clone(),
            state_key: state_key.clone(),
            provider_id: chosen.id.clone(),
            epsilon: recommendation.epsilon,
            mode: recommendation.mode,
            signal,
            q_value: recommendation.q_value,
            context: request.context.clone(),
            dispatch: None,
            outcome: None,
            reward: None,
            status: TraceStatus::Pending,
        };
        self.store.create(trace).map_err(internal)?;

        // If this future is cancelled before the dispatch record lands, the
        // persisted decision is marked abandoned and accepts no feedback.
        let mut abandon_guard = AbandonGuard {
            store: self.store.clone(),
            decision_id: decision_id.clone(),
            armed: true,
        };

        // Suspension point (b): executor dispatch, bounded by its deadline.
        let dispatch_started = Instant::now();
        let dispatch_request = DispatchRequest {
            decision_id: decision_id.clone(),
            tenant: request.tenant.clone(),
            provider_id: chosen.id.clone(),
            context: request.context.clone(),
        };
        let dispatch_result = tokio::time::timeout(
            self.cfg.dispatch_timeout,
            self.dispatcher.dispatch(chosen.endpoint.as_deref(), &dispatch_request),
        )
        .await;

        let dispatch_record = match dispatch_result {
            Ok(Ok(success)) => DispatchRecord {
                accepted: true,
                completion_handle: Some(success.completion_handle),
                error_kind: None,
                dispatch_latency_ms: dispatch_started.elapsed().as_secs_f64() * 1000.0,
            },
            Ok(Err(failure)) => {
                self.metrics.bump_dispatch_failure();
                DispatchRecord {
                    accepted: false,
                    completion_handle: None,
                    error_kind: Some(failure.kind.as_str().to_string()),
                    dispatch_latency_ms: dispatch_started.elapsed().as_secs_f64() * 1000.0,
                }
            }
            Err(_elapsed) => {
                self.metrics.bump_dispatch_failure();
                DispatchRecord {
                    accepted: false,
                    completion_handle: None,
                    error_kind: Some("timeout".to_string()),
                    dispatch_latency_ms: self.cfg.dispatch_timeout.as_secs_f64() * 1000.0,
                }
            }
        };
        self.store
            .record_dispatch(&decision_id, dispatch_record.clone())
            .map_err(internal)?;
        abandon_guard.armed = false;

        match recommendation.mode {
            crate::models::SelectionMode::Explore => self.metrics.bump_explore(),
            crate::models::SelectionMode::Exploit => self.metrics.bump_exploit(),
        }
        self.metrics
            .decide_latency
            .observe_us(start.elapsed().as_micros() as u64);

        info!(
            decision_id = %decision_id,
            provider = %chosen.id,
            mode = recommendation.mode.as_str(),
            state_key = %state_key,
            "decision made"
        );

        Ok(DecideResponse {
            decision_id,
            provider: chosen.id.clone(),
            metadata: DecideMetadata {
                state_key,
                mode: recommendation.mode.as_str(),
                epsilon: recommendation.epsilon,
                signal,
                q_value: recommendation.q_value,
                decision_count: recommendation.decision_count,
                dispatch_accepted: dispatch_record.accepted,
                completion_handle: dispatch_record.completion_handle,
                dispatch_error: dispatch_record.error_kind,
            },
        })
    }

    /// Close the loop for one decision. Idempotent by decision id: a second
    /// call surfaces the prior reward and leaves the value table unchanged.
    pub async fn feedback(
        &self,
        decision_id: &str,
        outcome: Outcome,
    ) -> Result<FeedbackResponse, RouteError> {
        let _permit = self
            .feedback_permits
            .try_acquire()
            .map_err(|_| {
                self.metrics.bump_overloaded();
                RouteError::Overloaded("feedback")
            })?;
        let start = Instant::now();

        let trace = self
            .store
            .get(decision_id)
            .ok_or_else(|| RouteError::UnknownDecision(decision_id.to_string()))?;

        if !outcome.is_finite() {
            self.metrics.bump_poisoned();
            if trace.status == TraceStatus::Pending {
                self.store
                    .mark_poisoned(decision_id, "non-finite outcome")
                    .map_err(internal)?;
            }
            return Err(RouteError::InvalidInput(
                "outcome contains non-finite values".to_string(),
            ));
        }

        let reward = compute_reward(&outcome);

        // Compare-and-set on the outcome tail; this is the idempotency point.
        // Suspension point: the decision-store write.
        self.store.finalize(decision_id, outcome.clone(), reward)?;

        // Value-table update becomes visible only after the outcome is
        // durable. Terminal semantics: no next state.
        let old_q = self
            .strategist
            .table()
            .value(&trace.state_key, &trace.provider_id);
        let new_q = self
            .strategist
            .update(&trace.state_key, &trace.provider_id, reward, None)?;
        self.metrics.bump_value_update();
        *self.metrics.last_reward.write() = reward;

        if (new_q - old_q).abs() > ANOMALY_Q_JUMP {
            let _ = self
                .validator
                .flag_anomaly(
                    decision_id,
                    &trace.state_key,
                    &trace.provider_id,
                    &format!("q-value jump {:.2} -> {:.2}", old_q, new_q),
                )
                .await;
        }

        // Exactly one decay per feedback event.
        self.strategist.decay_epsilon();

        if outcome.success {
            self.metrics.bump_feedback_success();
        } else {
            self.metrics.bump_feedback_failure();
        }

        // Fold the finalized trace into the federation log; the projection
        // now includes this record.
        let mut record = MemoryRecord::new(
            "decision_trace",
            "router",
            "1",
            serde_json::json!({
                "decision_id": decision_id,
                "tenant": trace.tenant,
                "state_key": trace.state_key,
                "provider_id": trace.provider_id,
                "reward": reward,
                "outcome": outcome,
            }),
        );
        record.signer_id = Some(self.cfg.node_id.clone());
        record.merkle_root = Some(self.federation.root());
        record.sig = self.verifier.sign(&record);
        if let Err(e) = self.federation.insert(record) {
            warn!(error = %e, "federation fold failed");
        }

        // Periodic snapshot of the policy state.
        let updates = self.strategist.update_count();
        if self.cfg.snapshot_every > 0 && updates % self.cfg.snapshot_every == 0 {
            let snap = crate::strategist::Snapshot::capture(&self.strategist);
            if let Err(e) = snap.save_to_dir(&self.cfg.snapshot_dir) {
                warn!(error = %e, "auto-snapshot failed");
            }
        }

        self.metrics
            .feedback_latency
            .observe_us(start.elapsed().as_micros() as u64);

        Ok(FeedbackResponse {
            reward,
            explanation: explain_reward(&outcome, reward),
            q_updates: updates,
        })
    }

    pub async fn status(&self) -> Result<StatusResponse, RouteError> {
        let audit = self
            .validator
            .log()
            .stats()
            .await
            .map_err(internal)?;
        Ok(StatusResponse {
            node_id: self.cfg.node_id.clone(),
            uptime_seconds: self.started.elapsed().as_secs(),
            strategist: self.strategist.stats(),
            store: self.store.stats(),
            audit,
            signal: self.signal.stats(),
            providers: self.providers.len(),
            federation_records: self.federation.len(),
            federation_root: self.federation.root(),
        })
    }

    pub fn gauges(&self) -> GaugeSnapshot {
        let strat = self.strategist.stats();
        let store = self.store.stats();
        GaugeSnapshot {
            epsilon: strat.epsilon,
            value_table_states: strat.state_count,
            value_table_pairs: strat.pair_count,
            store_traces: store.total_traces,
            store_pending: store.pending,
            signal_hit_rate: self.signal.stats().hit_rate,
            federation_records: self.federation.len(),
            providers: self.providers.len(),
        }
    }
}

/// Rolls a cancelled decision back to the last atomic boundary: persisted but
/// never dispatched means abandoned.
struct AbandonGuard {
    store: Arc<DecisionStore>,
    decision_id: String,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.store.mark_abandoned(&self.decision_id) {
                warn!(decision_id = %self.decision_id, error = %e, "abandon mark failed");
            }
        }
    }
}

fn validate_request(request: &DecideRequest) -> Result<(), RouteError> {
    if request.tenant.trim().is_empty() {
        return Err(RouteError::InvalidInput("tenant is empty".to_string()));
    }
    let ctx = &request.context;
    if ctx.workload_class.trim().is_empty()
        || ctx.accelerator.trim().is_empty()
        || ctx.region.trim().is_empty()
    {
        return Err(RouteError::InvalidInput(
            "context requires workload_class, accelerator and region".to_string(),
        ));
    }
    if !ctx.resource_hours.is_finite() || ctx.resource_hours <= 0.0 {
        return Err(RouteError::InvalidInput(
            "resource_hours must be positive and finite".to_string(),
        ));
    }
    for (name, value) in [
        ("max_price", request.constraints.max_price),
        ("max_latency_ms", request.constraints.max_latency_ms),
        ("min_reputation", request.constraints.min_reputation),
    ] {
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(RouteError::InvalidInput(format!("{} is not finite", name)));
            }
        }
    }
    Ok(())
}

fn internal(e: anyhow::Error) -> RouteError {
    RouteError::Corruption(e.to_string())
}

// Small metric helpers keep the call sites quiet.
impl RouterMetrics {
    fn bump_explore(&self) {
        self.decisions_explore
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_exploit(&self) {
        self.decisions_exploit
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_no_viable(&self) {
        self.no_viable_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_policy_reject(&self) {
        self.policy_rejects_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_overloaded(&self) {
        self.overloaded_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_dispatch_failure(&self) {
        self.dispatch_failures_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_feedback_success(&self) {
        self.feedback_success_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_feedback_failure(&self) {
        self.feedback_failure_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_poisoned(&self) {
        self.poisoned_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
    fn bump_value_update(&self) {
        self.value_updates_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
