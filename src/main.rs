//! GridRoute - Adaptive Multi-Provider Routing Control Plane
//!
//! Wires the Strategist/Executor/Auditor loop behind the ingress API, starts
//! the federation sync worker on its own cadence, and runs the capacity-step
//! controller in the background.

use anyhow::{Context, Result};
use gridroute_backend::api::{build_router, AppState};
use gridroute_backend::audit::{AuditLog, AuditMode, Validator};
use gridroute_backend::config::Config;
use gridroute_backend::executor::HttpDispatcher;
use gridroute_backend::federation::{
    load_peers, FederationLog, HmacVerifier, HttpPeerClient, NoopVerifier, RecordValidator,
    RecordVerifier, SyncEngine,
};
use gridroute_backend::policyhost::PolicyHost;
use gridroute_backend::providers::ProviderDirectory;
use gridroute_backend::router::{RouterCore, RouterCoreConfig};
use gridroute_backend::signal::SignalSource;
use gridroute_backend::store::DecisionStore;
use gridroute_backend::strategist::{Snapshot, Strategist, StrategistConfig};
use gridroute_backend::telemetry::RouterMetrics;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sync workers never share threads with ingress handlers; this caps the
/// federation fetch pool.
const SYNC_WORKERS: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "gridroute=info,gridroute_backend=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("load configuration")?;
    info!(node_id = %config.node_id, port = config.port, "gridroute starting");

    // Strategist, restoring the latest snapshot when one exists.
    let strategist = Arc::new(Strategist::new(StrategistConfig {
        alpha: config.alpha,
        gamma: config.gamma,
        epsilon: config.epsilon,
        epsilon_min: config.epsilon_min,
        epsilon_decay: config.epsilon_decay,
    }));
    match Snapshot::load_latest(&config.snapshot_dir) {
        Ok(Some(snapshot)) => {
            snapshot.apply(&strategist);
            info!(
                states = strategist.stats().state_count,
                epsilon = strategist.epsilon(),
                "restored value-table snapshot"
            );
        }
        Ok(None) => info!("no value-table snapshot, starting fresh"),
        Err(e) => return Err(e.context("load value-table snapshot")),
    }

    // Auditor
    let audit_db = config
        .audit_db_path
        .to_str()
        .context("audit db path is not valid UTF-8")?
        .to_string();
    if let Some(parent) = config.audit_db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("create audit db dir")?;
        }
    }
    let audit_log = Arc::new(AuditLog::open(&audit_db).context("open audit log")?);
    let mode = if config.strict_audit {
        AuditMode::Strict
    } else {
        AuditMode::Permissive
    };
    let validator = Arc::new(Validator::new(mode, audit_log));

    // Provider fleet
    let providers = match &config.providers_file {
        Some(path) => {
            let list = ProviderDirectory::load_file(path)?;
            info!(count = list.len(), file = %path.display(), "loaded provider fleet");
            Arc::new(ProviderDirectory::new(list))
        }
        None => {
            warn!("no providers file configured; fleet starts empty");
            Arc::new(ProviderDirectory::new(Vec::new()))
        }
    };

    // Stores
    let store = Arc::new(DecisionStore::open(&config.store_path).context("open decision store")?);
    let federation =
        Arc::new(FederationLog::open(&config.federation_log_path).context("open federation log")?);
    info!(
        traces = store.len(),
        federation_records = federation.len(),
        "stores recovered"
    );

    // Signal source
    let signal = Arc::new(SignalSource::new(
        config.signal_url.clone(),
        Duration::from_millis(config.signal_timeout_ms),
        Duration::from_millis(config.signal_cache_ttl_ms),
    ));

    // Executor
    let dispatcher = Arc::new(HttpDispatcher::new(Duration::from_millis(
        config.dispatch_timeout_ms,
    )));

    // Policy host (optional hard gate)
    let policy = match &config.policy_module {
        Some(path) => {
            let host = PolicyHost::load(path, Duration::from_millis(config.policy_timeout_ms))
                .with_context(|| format!("load policy module {}", path.display()))?;
            info!(module = %path.display(), "policy host active");
            Some(Arc::new(host))
        }
        None => None,
    };

    // Record signing
    let verifier: Arc<dyn RecordVerifier> = match &config.signing_key {
        Some(key) => Arc::new(HmacVerifier::new(key)),
        None => {
            if config.require_signatures {
                anyhow::bail!("require_signatures is set but no signing key is configured");
            }
            Arc::new(NoopVerifier)
        }
    };

    let metrics = Arc::new(RouterMetrics::new());
    let router_core = Arc::new(RouterCore::new(
        RouterCoreConfig {
            node_id: config.node_id.clone(),
            dispatch_timeout: Duration::from_millis(config.dispatch_timeout_ms),
            snapshot_dir: config.snapshot_dir.clone(),
            snapshot_every: config.snapshot_every,
            max_inflight_decisions: config.max_inflight_decisions,
            max_inflight_feedback: config.max_inflight_feedback,
        },
        strategist,
        validator,
        providers.clone(),
        store,
        signal,
        dispatcher,
        policy,
        federation.clone(),
        verifier.clone(),
        metrics.clone(),
    ));

    // Capacity-step controller: refresh the per-step ledger once a minute.
    {
        let providers = providers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                providers.reset_step();
            }
        });
    }

    // Federation sync worker, on its own cadence and worker pool.
    let peers = match &config.peers_file {
        Some(path) => {
            let peers = load_peers(path)?;
            info!(count = peers.len(), "federation peers configured");
            peers
        }
        None => Vec::new(),
    };
    if !peers.is_empty() {
        let record_validator = Arc::new(RecordValidator::new(
            verifier.clone(),
            config.require_signatures,
        ));
        let engine = Arc::new(SyncEngine::new(
            federation.clone(),
            record_validator,
            &config.retry_backoff_secs,
            config.sync_page_size,
            SYNC_WORKERS,
        ));
        let peer_list = peers.clone();
        let peer_timeout = Duration::from_millis(config.peer_timeout_ms);
        let interval_secs = config.sync_interval_secs.max(1);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                for peer in &peer_list {
                    let client = HttpPeerClient::new(&peer.url, peer_timeout);
                    match engine.sync_peer(&peer.name, &client).await {
                        Ok(report) => {
                            metrics
                                .sync_inserted_total
                                .fetch_add(report.inserted, Ordering::Relaxed);
                            metrics
                                .sync_failed_total
                                .fetch_add(report.failed, Ordering::Relaxed);
                            if report.inserted > 0 || report.failed > 0 {
                                info!(
                                    peer = %report.peer,
                                    inserted = report.inserted,
                                    failed = report.failed,
                                    conflicts = report.conflicts,
                                    "federation sync pass"
                                );
                            }
                        }
                        Err(e) => warn!(peer = %peer.name, error = %e, "federation sync failed"),
                    }
                }
            }
        });
    }

    let state = AppState {
        router: router_core,
        peers: Arc::new(peers),
        node_id: config.node_id.clone(),
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!(%addr, "gridroute ready");
    axum::serve(listener, app).await.context("serve")?;

    Ok(())
}
