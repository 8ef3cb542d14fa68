//! End-to-end tests for the decision-execution-feedback loop, driven through
//! the router core with an in-process dispatcher.

use async_trait::async_trait;
use gridroute_backend::audit::{AuditMode, AuditLog, AuditStatus, Validator, Violation};
use gridroute_backend::executor::{
    DispatchFailure, DispatchRequest, DispatchSuccess, ProviderDispatcher,
};
use gridroute_backend::federation::{FederationLog, NoopVerifier};
use gridroute_backend::models::{Constraints, Outcome, WorkloadContext};
use gridroute_backend::providers::{Provider, ProviderDirectory};
use gridroute_backend::router::{DecideRequest, RouterCore, RouterCoreConfig};
use gridroute_backend::signal::SignalSource;
use gridroute_backend::store::DecisionStore;
use gridroute_backend::strategist::{featurize, Strategist, StrategistConfig};
use gridroute_backend::telemetry::RouterMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

struct MockDispatcher;

#[async_trait]
impl ProviderDispatcher for MockDispatcher {
    async fn dispatch(
        &self,
        _endpoint: Option<&str>,
        request: &DispatchRequest,
    ) -> Result<DispatchSuccess, DispatchFailure> {
        Ok(DispatchSuccess {
            completion_handle: format!("handle-{}", request.decision_id),
        })
    }
}

fn provider(id: &str, price: f64) -> Provider {
    Provider {
        id: id.to_string(),
        name: id.to_string(),
        regions: vec!["us-west".into()],
        accelerators: vec!["a100".into()],
        price_per_hour: [("a100".to_string(), price)].into_iter().collect(),
        credits_per_hour: BTreeMap::new(),
        base_latency_ms: 40.0,
        capacity_per_step: 1_000.0,
        reputation: 90.0,
        active: true,
        endpoint: None,
    }
}

fn context() -> WorkloadContext {
    WorkloadContext {
        workload_class: "llm_inference".into(),
        accelerator: "a100".into(),
        region: "us-west".into(),
        resource_hours: 2.0,
        cpu_cores: Some(8),
        memory_gb: Some(32.0),
    }
}

struct Harness {
    router: RouterCore,
    _dirs: Vec<tempfile::TempDir>,
}

fn harness(providers: Vec<Provider>, epsilon: f64, seed: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let strategist = Arc::new(Strategist::with_seed(
        StrategistConfig {
            epsilon,
            epsilon_min: if epsilon == 0.0 { 0.0 } else { 0.01 },
            ..StrategistConfig::default()
        },
        seed,
    ));
    let validator = Arc::new(Validator::new(
        AuditMode::Strict,
        Arc::new(AuditLog::open_in_memory().unwrap()),
    ));
    let store = Arc::new(DecisionStore::open(&dir.path().join("decisions.log")).unwrap());
    let federation = Arc::new(FederationLog::open(&dir.path().join("federation.log")).unwrap());
    let metrics = Arc::new(RouterMetrics::new());

    let router = RouterCore::new(
        RouterCoreConfig {
            node_id: "test-node".into(),
            dispatch_timeout: Duration::from_millis(500),
            snapshot_dir: dir.path().join("snapshots"),
            snapshot_every: 0,
            max_inflight_decisions: 64,
            max_inflight_feedback: 64,
        },
        strategist,
        validator,
        Arc::new(ProviderDirectory::new(providers)),
        store,
        Arc::new(SignalSource::disabled()),
        Arc::new(MockDispatcher),
        None,
        federation,
        Arc::new(NoopVerifier),
        metrics,
    );
    Harness {
        router,
        _dirs: vec![dir],
    }
}

fn decide_request() -> DecideRequest {
    serde_json::from_value(serde_json::json!({
        "tenant": "acme",
        "context": {
            "workload_class": "llm_inference",
            "accelerator": "a100",
            "region": "us-west",
            "resource_hours": 2.0,
            "cpu_cores": 8,
            "memory_gb": 32.0
        }
    }))
    .unwrap()
}

fn success_outcome() -> Outcome {
    Outcome {
        success: true,
        actual_cost: 2.0,
        actual_latency_ms: 120.0,
        actual_reputation: Some(90.0),
        error_reason: None,
    }
}

#[tokio::test]
async fn exploit_path_picks_learned_provider_and_updates_exactly() {
    let h = harness(vec![provider("akash", 2.0), provider("vast", 2.0)], 0.0, 7);
    let state_key = featurize(&context(), &Constraints::default(), None);

    // akash carries value 1.0, vast 0.0
    h.router.strategist().table().update(&state_key, "akash", |_| 1.0);

    let resp = h.router.decide(decide_request()).await.unwrap();
    assert_eq!(resp.provider, "akash");
    assert_eq!(resp.metadata.mode, "exploit");
    assert_eq!(resp.metadata.q_value, 1.0);
    assert!(resp.metadata.dispatch_accepted);

    // Reward +1, terminal: q stays exactly 1 = 1 + alpha*(1 - 1)
    let outcome = Outcome {
        success: true,
        actual_cost: 10.0,
        actual_latency_ms: 0.0,
        actual_reputation: None,
        error_reason: None,
    };
    // Craft a reward of exactly 1.0: success 10 - cost 10 + rep 1.0
    let outcome = Outcome {
        actual_reputation: Some(100.0),
        ..outcome
    };
    let fb = h.router.feedback(&resp.decision_id, outcome).await.unwrap();
    assert_eq!(fb.reward, 1.0);
    assert_eq!(
        h.router.strategist().table().value(&state_key, "akash"),
        1.0
    );
}

#[tokio::test]
async fn explore_path_is_reproducible_under_a_seed() {
    let run = |seed: u64| async move {
        let h = harness(
            vec![
                provider("akash", 2.0),
                provider("ionet", 2.0),
                provider("render", 2.0),
                provider("vast", 2.0),
            ],
            1.0,
            seed,
        );
        let resp = h.router.decide(decide_request()).await.unwrap();
        assert_eq!(resp.metadata.mode, "explore");
        resp.provider
    };
    assert_eq!(run(42).await, run(42).await);
}

#[tokio::test]
async fn strict_constraint_violation_rejects_candidate() {
    let h = harness(
        vec![provider("cheap", 1.0), provider("pricey", 9.0)],
        0.0,
        3,
    );
    let mut request = decide_request();
    request.constraints = Constraints {
        max_price: Some(2.0),
        ..Constraints::default()
    };

    let resp = h.router.decide(request).await.unwrap();
    assert_eq!(resp.provider, "cheap");

    // The filter stage logged a rejected entry with violation {price}
    let entries = h.router.validator().log().recent(10).await.unwrap();
    let rejected: Vec<_> = entries
        .iter()
        .filter(|e| e.status == AuditStatus::Rejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].provider_id, "pricey");
    assert_eq!(rejected[0].violations, vec![Violation::Price]);

    // Exactly one entry carries the real decision id, and it is not rejected
    let final_entries = h
        .router
        .validator()
        .log()
        .for_decision(&resp.decision_id)
        .await
        .unwrap();
    assert_eq!(final_entries.len(), 1);
    assert_ne!(final_entries[0].status, AuditStatus::Rejected);
}

#[tokio::test]
async fn all_candidates_rejected_is_no_viable_providers() {
    let h = harness(vec![provider("pricey", 9.0)], 0.0, 3);
    let mut request = decide_request();
    request.constraints = Constraints {
        max_price: Some(2.0),
        ..Constraints::default()
    };
    let err = h.router.decide(request).await.unwrap_err();
    assert_eq!(err.kind(), "no_viable_providers");
}

#[tokio::test]
async fn feedback_is_idempotent_by_decision_id() {
    let h = harness(vec![provider("akash", 2.0)], 0.0, 5);
    let resp = h.router.decide(decide_request()).await.unwrap();
    let state_key = resp.metadata.state_key.clone();

    let first = h
        .router
        .feedback(&resp.decision_id, success_outcome())
        .await
        .unwrap();
    let q_after_first = h.router.strategist().table().value(&state_key, "akash");
    let eps_after_first = h.router.strategist().epsilon();

    // Second call: prior reward surfaces, no second update, no second decay
    let err = h
        .router
        .feedback(&resp.decision_id, success_outcome())
        .await
        .unwrap_err();
    match err {
        gridroute_backend::RouteError::AlreadyFinalized { reward, .. } => {
            assert_eq!(reward, first.reward)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        h.router.strategist().table().value(&state_key, "akash"),
        q_after_first
    );
    assert_eq!(h.router.strategist().epsilon(), eps_after_first);
}

#[tokio::test]
async fn untouched_pairs_stay_exactly_zero() {
    let h = harness(vec![provider("akash", 2.0), provider("vast", 2.0)], 0.0, 9);

    for _ in 0..5 {
        let resp = h.router.decide(decide_request()).await.unwrap();
        // ε = 0 with all-zero values: lowest id (akash) always wins
        assert_eq!(resp.provider, "akash");
        h.router
            .feedback(&resp.decision_id, success_outcome())
            .await
            .unwrap();
    }

    let state_key = featurize(&context(), &Constraints::default(), None);
    assert_eq!(h.router.strategist().table().value(&state_key, "vast"), 0.0);
    assert_eq!(
        h.router
            .strategist()
            .table()
            .value("some|other|state|4|16|<50|none", "akash"),
        0.0
    );
}

#[tokio::test]
async fn epsilon_decays_monotonically_across_feedback() {
    let h = harness(vec![provider("akash", 2.0)], 0.5, 11);
    let mut prev = h.router.strategist().epsilon();
    for _ in 0..10 {
        let resp = h.router.decide(decide_request()).await.unwrap();
        h.router
            .feedback(&resp.decision_id, success_outcome())
            .await
            .unwrap();
        let eps = h.router.strategist().epsilon();
        assert!(eps <= prev);
        assert!(eps >= 0.01);
        prev = eps;
    }
}

#[tokio::test]
async fn non_finite_outcome_poisons_trace_without_update() {
    let h = harness(vec![provider("akash", 2.0)], 0.0, 13);
    let resp = h.router.decide(decide_request()).await.unwrap();

    let bad = Outcome {
        success: true,
        actual_cost: f64::NAN,
        actual_latency_ms: 100.0,
        actual_reputation: None,
        error_reason: None,
    };
    let err = h.router.feedback(&resp.decision_id, bad).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_input");

    // Table untouched, and the trace now refuses real feedback too
    assert_eq!(
        h.router
            .strategist()
            .table()
            .value(&resp.metadata.state_key, "akash"),
        0.0
    );
    let err = h
        .router
        .feedback(&resp.decision_id, success_outcome())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_input");
}

#[tokio::test]
async fn feedback_for_unknown_decision_is_not_found() {
    let h = harness(vec![provider("akash", 2.0)], 0.0, 15);
    let err = h
        .router
        .feedback("no-such-id", success_outcome())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_decision");
}

#[tokio::test]
async fn finalized_decision_folds_into_federation_projection() {
    let h = harness(vec![provider("akash", 2.0)], 0.0, 17);
    let empty_root = h.router.federation().root();

    let resp = h.router.decide(decide_request()).await.unwrap();
    assert_eq!(h.router.federation().len(), 0);

    h.router
        .feedback(&resp.decision_id, success_outcome())
        .await
        .unwrap();
    assert_eq!(h.router.federation().len(), 1);
    assert_ne!(h.router.federation().root(), empty_root);

    let record = &h.router.federation().all()[0];
    assert_eq!(record.kind, "decision_trace");
    assert_eq!(record.data["decision_id"], resp.decision_id.as_str());
}

#[tokio::test]
async fn new_provider_appears_as_fresh_zero_valued_action() {
    let h = harness(vec![provider("akash", 2.0)], 0.0, 19);
    let state_key = featurize(&context(), &Constraints::default(), None);
    h.router.strategist().table().update(&state_key, "akash", |_| -5.0);

    // A provider the table has never seen joins the fleet mid-flight
    h.router.providers().upsert(provider("fresh", 2.0));
    let resp = h.router.decide(decide_request()).await.unwrap();
    assert_eq!(resp.provider, "fresh");
    assert_eq!(resp.metadata.q_value, 0.0);
}

#[tokio::test]
async fn status_aggregates_component_stats() {
    let h = harness(vec![provider("akash", 2.0)], 0.0, 21);
    let resp = h.router.decide(decide_request()).await.unwrap();
    h.router
        .feedback(&resp.decision_id, success_outcome())
        .await
        .unwrap();

    let status = h.router.status().await.unwrap();
    assert_eq!(status.node_id, "test-node");
    assert_eq!(status.store.total_traces, 1);
    assert_eq!(status.store.finalized, 1);
    assert_eq!(status.strategist.update_count, 1);
    assert!(status.audit.total_entries >= 2);
    assert_eq!(status.federation_records, 1);
}
