//! State featurizer.
//!
//! Maps a workload context plus the optional adaptive-exploration signal to a
//! canonical state key. The key always has exactly [`FIELD_COUNT`] fields in
//! a fixed order:
//!
//! ```text
//! workload|accelerator|region|cpu|mem|latency|signal
//! ```
//!
//! Continuous fields are bucketed; categorical fields pass through verbatim;
//! a missing adaptive signal encodes as the literal token `none`. The
//! featurizer is pure and total: any context produces a key, and equal
//! contexts produce byte-identical keys across restarts.

use crate::models::{Constraints, WorkloadContext};

/// Number of `|`-separated fields in every state key.
pub const FIELD_COUNT: usize = 7;

const DEFAULT_CPU_CORES: u32 = 4;
const DEFAULT_MEMORY_GB: f64 = 16.0;
const DEFAULT_LATENCY_MS: f64 = 100.0;

/// Build the canonical state key for one decision.
pub fn featurize(
    context: &WorkloadContext,
    constraints: &Constraints,
    signal: Option<f64>,
) -> String {
    let cpu = bucket_cpu(context.cpu_cores.unwrap_or(DEFAULT_CPU_CORES));
    let mem = bucket_memory(context.memory_gb.unwrap_or(DEFAULT_MEMORY_GB));
    let lat = bucket_latency(constraints.max_latency_ms.unwrap_or(DEFAULT_LATENCY_MS));
    let sig = bucket_signal(signal);
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        context.workload_class, context.accelerator, context.region, cpu, mem, lat, sig
    )
}

fn bucket_cpu(cores: u32) -> &'static str {
    match cores {
        0..=2 => "2",
        3..=4 => "4",
        5..=8 => "8",
        9..=16 => "16",
        17..=32 => "32",
        _ => "64+",
    }
}

fn bucket_memory(gb: f64) -> &'static str {
    if gb <= 8.0 {
        "8"
    } else if gb <= 16.0 {
        "16"
    } else if gb <= 32.0 {
        "32"
    } else if gb <= 64.0 {
        "64"
    } else if gb <= 128.0 {
        "128"
    } else {
        "256+"
    }
}

fn bucket_latency(ms: f64) -> &'static str {
    if ms < 50.0 {
        "<50"
    } else if ms < 100.0 {
        "50-100"
    } else if ms < 200.0 {
        "100-200"
    } else {
        "200+"
    }
}

/// Signal in [0,1] rounded to 0.1 precision; absent → `none`.
fn bucket_signal(signal: Option<f64>) -> String {
    match signal {
        Some(s) if s.is_finite() => {
            let clamped = s.clamp(0.0, 1.0);
            format!("{:.1}", (clamped * 10.0).round() / 10.0)
        }
        _ => "none".to_string(),
    }
}
