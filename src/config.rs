//! Configuration: environment variables with an optional TOML profile file.
//!
//! Every knob has an env var (`GRIDROUTE_*`) and a matching key in the
//! profile file. Profile values override built-in defaults; env vars override
//! the profile.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Full runtime configuration for the control plane.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub node_id: String,

    // Persistence
    pub store_path: PathBuf,
    pub snapshot_dir: PathBuf,
    pub audit_db_path: PathBuf,
    pub federation_log_path: PathBuf,
    pub receipts_dir: PathBuf,
    pub providers_file: Option<PathBuf>,

    // External collaborators
    pub policy_module: Option<PathBuf>,
    pub peers_file: Option<PathBuf>,
    pub signal_url: Option<String>,

    // Timeouts (milliseconds)
    pub signal_timeout_ms: u64,
    pub signal_cache_ttl_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub policy_timeout_ms: u64,
    pub peer_timeout_ms: u64,

    // Federation
    pub sync_interval_secs: u64,
    pub retry_backoff_secs: Vec<u64>,
    pub sync_page_size: usize,
    pub require_signatures: bool,
    pub signing_key: Option<String>,

    // Auditor
    pub strict_audit: bool,

    // Strategist hyperparameters
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    pub snapshot_every: u64,

    // Ingress backpressure
    pub max_inflight_decisions: usize,
    pub max_inflight_feedback: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            node_id: "gridroute-local".to_string(),
            store_path: PathBuf::from("data/decisions.log"),
            snapshot_dir: PathBuf::from("data/snapshots"),
            audit_db_path: PathBuf::from("data/audit.db"),
            federation_log_path: PathBuf::from("data/federation.log"),
            receipts_dir: PathBuf::from("data/receipts"),
            providers_file: None,
            policy_module: None,
            peers_file: None,
            signal_url: None,
            signal_timeout_ms: 2_000,
            signal_cache_ttl_ms: 5_000,
            dispatch_timeout_ms: 5_000,
            policy_timeout_ms: 250,
            peer_timeout_ms: 15_000,
            sync_interval_secs: 60,
            retry_backoff_secs: vec![5, 10, 30],
            sync_page_size: 500,
            require_signatures: false,
            signing_key: None,
            strict_audit: true,
            alpha: 0.2,
            gamma: 0.92,
            epsilon: 0.1,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            snapshot_every: 10,
            max_inflight_decisions: 256,
            max_inflight_feedback: 256,
        }
    }
}

/// Subset of keys allowed in a `[profile.<name>]` section. All optional;
/// present keys override defaults.
#[derive(Debug, Default, Deserialize)]
struct Profile {
    port: Option<u16>,
    node_id: Option<String>,
    store_path: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    audit_db_path: Option<PathBuf>,
    federation_log_path: Option<PathBuf>,
    receipts_dir: Option<PathBuf>,
    providers_file: Option<PathBuf>,
    policy_module: Option<PathBuf>,
    peers_file: Option<PathBuf>,
    signal_url: Option<String>,
    signal_timeout_ms: Option<u64>,
    signal_cache_ttl_ms: Option<u64>,
    dispatch_timeout_ms: Option<u64>,
    policy_timeout_ms: Option<u64>,
    peer_timeout_ms: Option<u64>,
    sync_interval_secs: Option<u64>,
    retry_backoff_secs: Option<Vec<u64>>,
    sync_page_size: Option<usize>,
    require_signatures: Option<bool>,
    signing_key: Option<String>,
    strict_audit: Option<bool>,
    alpha: Option<f64>,
    gamma: Option<f64>,
    epsilon: Option<f64>,
    epsilon_min: Option<f64>,
    epsilon_decay: Option<f64>,
    snapshot_every: Option<u64>,
    max_inflight_decisions: Option<usize>,
    max_inflight_feedback: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profile: std::collections::BTreeMap<String, Profile>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
}

impl Config {
    /// Build configuration from defaults, an optional profile file, then env.
    ///
    /// `GRIDROUTE_PROFILE_FILE` / `GRIDROUTE_PROFILE` select the file and the
    /// named section (default section name: "default").
    pub fn load() -> Result<Self> {
        let mut cfg = Config::default();

        if let Ok(path) = env::var("GRIDROUTE_PROFILE_FILE") {
            let name = env::var("GRIDROUTE_PROFILE").unwrap_or_else(|_| "default".to_string());
            cfg.apply_profile(Path::new(&path), &name)?;
        }

        cfg.apply_env();
        Ok(cfg)
    }

    /// Merge a named `[profile.<name>]` section from a TOML file.
    pub fn apply_profile(&mut self, path: &Path, name: &str) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read profile file {}", path.display()))?;
        let file: ProfileFile =
            toml::from_str(&raw).with_context(|| format!("parse profile file {}", path.display()))?;
        let profile = file
            .profile
            .get(name)
            .with_context(|| format!("profile '{}' not found in {}", name, path.display()))?;

        macro_rules! take {
            ($field:ident) => {
                if let Some(v) = &profile.$field {
                    self.$field = v.clone().into();
                }
            };
        }
        take!(port);
        take!(node_id);
        take!(store_path);
        take!(snapshot_dir);
        take!(audit_db_path);
        take!(federation_log_path);
        take!(receipts_dir);
        if profile.providers_file.is_some() {
            self.providers_file = profile.providers_file.clone();
        }
        if profile.policy_module.is_some() {
            self.policy_module = profile.policy_module.clone();
        }
        if profile.peers_file.is_some() {
            self.peers_file = profile.peers_file.clone();
        }
        if profile.signal_url.is_some() {
            self.signal_url = profile.signal_url.clone();
        }
        take!(signal_timeout_ms);
        take!(signal_cache_ttl_ms);
        take!(dispatch_timeout_ms);
        take!(policy_timeout_ms);
        take!(peer_timeout_ms);
        take!(sync_interval_secs);
        take!(retry_backoff_secs);
        take!(sync_page_size);
        take!(require_signatures);
        if profile.signing_key.is_some() {
            self.signing_key = profile.signing_key.clone();
        }
        take!(strict_audit);
        take!(alpha);
        take!(gamma);
        take!(epsilon);
        take!(epsilon_min);
        take!(epsilon_decay);
        take!(snapshot_every);
        take!(max_inflight_decisions);
        take!(max_inflight_feedback);
        Ok(())
    }

    /// Env vars override everything else.
    fn apply_env(&mut self) {
        if let Some(v) = env_parse("GRIDROUTE_PORT") {
            self.port = v;
        }
        if let Ok(v) = env::var("GRIDROUTE_NODE_ID") {
            self.node_id = v;
        }
        if let Ok(v) = env::var("GRIDROUTE_STORE_PATH") {
            self.store_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GRIDROUTE_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GRIDROUTE_AUDIT_DB") {
            self.audit_db_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GRIDROUTE_FEDERATION_LOG") {
            self.federation_log_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GRIDROUTE_RECEIPTS_DIR") {
            self.receipts_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("GRIDROUTE_PROVIDERS_FILE") {
            self.providers_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("GRIDROUTE_POLICY_MODULE") {
            self.policy_module = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("GRIDROUTE_PEERS_FILE") {
            self.peers_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("GRIDROUTE_SIGNAL_URL") {
            self.signal_url = Some(v);
        }
        if let Some(v) = env_parse("GRIDROUTE_SIGNAL_TIMEOUT_MS") {
            self.signal_timeout_ms = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_SIGNAL_CACHE_TTL_MS") {
            self.signal_cache_ttl_ms = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_DISPATCH_TIMEOUT_MS") {
            self.dispatch_timeout_ms = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_POLICY_TIMEOUT_MS") {
            self.policy_timeout_ms = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_PEER_TIMEOUT_MS") {
            self.peer_timeout_ms = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_SYNC_INTERVAL_SECS") {
            self.sync_interval_secs = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_SYNC_PAGE_SIZE") {
            self.sync_page_size = v;
        }
        if let Some(v) = env_bool("GRIDROUTE_REQUIRE_SIGNATURES") {
            self.require_signatures = v;
        }
        if let Ok(v) = env::var("GRIDROUTE_SIGNING_KEY") {
            self.signing_key = Some(v);
        }
        if let Some(v) = env_bool("GRIDROUTE_STRICT_AUDIT") {
            self.strict_audit = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_ALPHA") {
            self.alpha = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_GAMMA") {
            self.gamma = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_EPSILON") {
            self.epsilon = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_EPSILON_MIN") {
            self.epsilon_min = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_EPSILON_DECAY") {
            self.epsilon_decay = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_SNAPSHOT_EVERY") {
            self.snapshot_every = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_MAX_INFLIGHT_DECISIONS") {
            self.max_inflight_decisions = v;
        }
        if let Some(v) = env_parse("GRIDROUTE_MAX_INFLIGHT_FEEDBACK") {
            self.max_inflight_feedback = v;
        }
    }
}
