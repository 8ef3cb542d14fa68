//! Policy host: sandboxed declarative policy modules.
//!
//! A policy module is a WASM binary exporting `memory`, `allocate(len) → ptr`
//! and `authorize_json(ptr, len) → packed` where `packed = ptr << 32 | len`
//! points at a JSON `{allow, reason}` result in module memory. The module is
//! pure: host memory is the only I/O it gets.
//!
//! Execution carries a wall-clock cap enforced through epoch interruption (a
//! millisecond ticker thread); exceeding it is a hard reject with reason
//! `policy_timeout`. Any other failure is likewise a hard reject, regardless
//! of the auditor's strict/permissive mode.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, Instance, Module, Store, Trap};

pub const TIMEOUT_REASON: &str = "policy_timeout";

/// JSON input handed to the module.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub treaty: Value,
    pub order: Value,
    pub acc: Value,
}

/// Module verdict. `allow == false` is a hard reject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allow: bool,
    #[serde(default)]
    pub reason: String,
}

impl PolicyDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

/// Host for one compiled policy module.
pub struct PolicyHost {
    engine: Engine,
    module: Module,
    timeout: Duration,
}

impl PolicyHost {
    /// Compile the module and start the epoch ticker.
    pub fn load(path: &Path, timeout: Duration) -> Result<Self> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        config.wasm_threads(false);
        config.wasm_simd(false);
        let engine = Engine::new(&config).map_err(|e| anyhow!("wasmtime config error: {}", e))?;

        let module = Module::from_file(&engine, path)
            .with_context(|| format!("compile policy module {}", path.display()))?;

        // Millisecond ticker: stores set their deadline in ticks.
        let ticker_engine = engine.clone();
        std::thread::Builder::new()
            .name("policy-epoch-ticker".to_string())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_millis(1));
                ticker_engine.increment_epoch();
            })
            .context("spawn policy epoch ticker")?;

        Ok(Self {
            engine,
            module,
            timeout,
        })
    }

    /// Evaluate the module. Never errors: every failure mode collapses to a
    /// hard reject with a reason.
    pub async fn authorize(&self, input: &PolicyInput) -> PolicyDecision {
        let bytes = match serde_json::to_vec(input) {
            Ok(b) => b,
            Err(e) => return PolicyDecision::reject(format!("policy input encoding: {}", e)),
        };

        let engine = self.engine.clone();
        let module = self.module.clone();
        let deadline_ticks = self.timeout.as_millis().max(1) as u64;

        let result = tokio::task::spawn_blocking(move || {
            call_authorize(&engine, &module, &bytes, deadline_ticks)
        })
        .await;

        match result {
            Ok(Ok(decision)) => {
                debug!(allow = decision.allow, reason = %decision.reason, "policy verdict");
                decision
            }
            Ok(Err(e)) => {
                if is_epoch_trap(&e) {
                    warn!("policy module exceeded wall-clock cap");
                    PolicyDecision::reject(TIMEOUT_REASON)
                } else {
                    warn!(error = %e, "policy module failed");
                    PolicyDecision::reject(format!("policy execution error: {}", e))
                }
            }
            Err(join_err) => PolicyDecision::reject(format!("policy task failed: {}", join_err)),
        }
    }
}

fn is_epoch_trap(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Trap>(), Some(Trap::Interrupt))
}

fn call_authorize(
    engine: &Engine,
    module: &Module,
    input: &[u8],
    deadline_ticks: u64,
) -> Result<PolicyDecision> {
    let mut store: Store<()> = Store::new(engine, ());
    store.set_epoch_deadline(deadline_ticks);

    let instance = Instance::new(&mut store, module, &[])
        .map_err(|e| anyhow!("instantiate policy module: {}", e))?;

    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| anyhow!("policy module must export 'memory'"))?;
    let allocate = instance
        .get_typed_func::<u32, u32>(&mut store, "allocate")
        .map_err(|e| anyhow!("'allocate' export missing: {}", e))?;
    let authorize = instance
        .get_typed_func::<(u32, u32), u64>(&mut store, "authorize_json")
        .map_err(|e| anyhow!("'authorize_json' export missing: {}", e))?;

    let input_ptr = allocate.call(&mut store, input.len() as u32)?;
    memory
        .write(&mut store, input_ptr as usize, input)
        .map_err(|e| anyhow!("policy memory write failed: {}", e))?;

    let packed = authorize.call(&mut store, (input_ptr, input.len() as u32))?;
    let result_ptr = (packed >> 32) as u32;
    let result_len = packed as u32;

    let mut buf = vec![0u8; result_len as usize];
    memory
        .read(&store, result_ptr as usize, &mut buf)
        .map_err(|e| anyhow!("policy memory read failed: {}", e))?;

    let decision: PolicyDecision =
        serde_json::from_slice(&buf).map_err(|e| anyhow!("malformed policy verdict: {}", e))?;
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_parsing() {
        let d: PolicyDecision = serde_json::from_str(r#"{"allow":true,"reason":"ok"}"#).unwrap();
        assert!(d.allow);
        let d: PolicyDecision = serde_json::from_str(r#"{"allow":false}"#).unwrap();
        assert!(!d.allow);
        assert_eq!(d.reason, "");
    }

    #[test]
    fn test_input_shape() {
        let input = PolicyInput {
            treaty: serde_json::json!({"tenant": "acme"}),
            order: serde_json::json!({"provider_id": "akash"}),
            acc: serde_json::json!({"decisions": 10}),
        };
        let v = serde_json::to_value(&input).unwrap();
        assert!(v.get("treaty").is_some());
        assert!(v.get("order").is_some());
        assert!(v.get("acc").is_some());
    }

    #[test]
    fn test_missing_module_file_is_error() {
        let err = PolicyHost::load(Path::new("/nonexistent/policy.wasm"), Duration::from_millis(50));
        assert!(err.is_err());
    }
}
