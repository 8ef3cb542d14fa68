//! Metrics registry with Prometheus text exposition.
//!
//! Counters are atomics, latency is a fixed-bucket histogram, and gauges are
//! sampled from the live components at exposition time.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fixed-bucket latency histogram (microseconds).
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 100µs .. 10s
        let buckets = vec![
            100, 500, 1_000, 5_000, 10_000, 50_000, 100_000, 500_000, 1_000_000, 5_000_000,
            10_000_000,
        ];
        let counts = (0..=buckets.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe_us(&self, us: u64) {
        let idx = self
            .buckets
            .iter()
            .position(|&b| us <= b)
            .unwrap_or(self.buckets.len());
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_prometheus(&self, name: &str, labels: &str) -> String {
        let mut out = String::new();
        let mut cumulative = 0u64;
        for (i, bound) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            out.push_str(&format!(
                "{}_bucket{{{}le=\"{}\"}} {}\n",
                name,
                labels,
                *bound as f64 / 1_000_000.0,
                cumulative
            ));
        }
        cumulative += self.counts[self.buckets.len()].load(Ordering::Relaxed);
        out.push_str(&format!(
            "{}_bucket{{{}le=\"+Inf\"}} {}\n",
            name, labels, cumulative
        ));
        out.push_str(&format!(
            "{}_sum{{{}}} {}\n",
            name,
            labels.trim_end_matches(','),
            self.sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        out.push_str(&format!(
            "{}_count{{{}}} {}\n",
            name,
            labels.trim_end_matches(','),
            self.count.load(Ordering::Relaxed)
        ));
        out
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Control-plane metrics registry.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub decisions_explore: AtomicU64,
    pub decisions_exploit: AtomicU64,
    pub no_viable_total: AtomicU64,
    pub policy_rejects_total: AtomicU64,
    pub overloaded_total: AtomicU64,
    pub dispatch_failures_total: AtomicU64,
    pub feedback_success_total: AtomicU64,
    pub feedback_failure_total: AtomicU64,
    pub poisoned_total: AtomicU64,
    pub value_updates_total: AtomicU64,
    pub sync_inserted_total: AtomicU64,
    pub sync_failed_total: AtomicU64,
    pub decide_latency: LatencyHistogram,
    pub feedback_latency: LatencyHistogram,
    /// Last reward observed, for quick operator sanity checks.
    pub last_reward: RwLock<f64>,
}

/// Point-in-time gauges sampled from live components at exposition.
#[derive(Debug, Clone, Default)]
pub struct GaugeSnapshot {
    pub epsilon: f64,
    pub value_table_states: usize,
    pub value_table_pairs: usize,
    pub store_traces: u64,
    pub store_pending: u64,
    pub signal_hit_rate: f64,
    pub federation_records: usize,
    pub providers: usize,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_prometheus(&self, gauges: &GaugeSnapshot) -> String {
        let mut out = String::new();

        out.push_str("# HELP gridroute_decisions_total Routing decisions made\n");
        out.push_str("# TYPE gridroute_decisions_total counter\n");
        out.push_str(&format!(
            "gridroute_decisions_total{{mode=\"explore\"}} {}\n",
            self.decisions_explore.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "gridroute_decisions_total{{mode=\"exploit\"}} {}\n",
            self.decisions_exploit.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_no_viable_total Decisions with an empty candidate pool\n");
        out.push_str("# TYPE gridroute_no_viable_total counter\n");
        out.push_str(&format!(
            "gridroute_no_viable_total {}\n",
            self.no_viable_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_policy_rejects_total Hard rejects from the policy host\n");
        out.push_str("# TYPE gridroute_policy_rejects_total counter\n");
        out.push_str(&format!(
            "gridroute_policy_rejects_total {}\n",
            self.policy_rejects_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_overloaded_total Ingress fast-fails due to backpressure\n");
        out.push_str("# TYPE gridroute_overloaded_total counter\n");
        out.push_str(&format!(
            "gridroute_overloaded_total {}\n",
            self.overloaded_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_dispatch_failures_total Executor dispatch failures\n");
        out.push_str("# TYPE gridroute_dispatch_failures_total counter\n");
        out.push_str(&format!(
            "gridroute_dispatch_failures_total {}\n",
            self.dispatch_failures_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_feedback_total Feedback events by outcome\n");
        out.push_str("# TYPE gridroute_feedback_total counter\n");
        out.push_str(&format!(
            "gridroute_feedback_total{{outcome=\"success\"}} {}\n",
            self.feedback_success_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "gridroute_feedback_total{{outcome=\"failure\"}} {}\n",
            self.feedback_failure_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_poisoned_total Traces poisoned by non-finite outcomes\n");
        out.push_str("# TYPE gridroute_poisoned_total counter\n");
        out.push_str(&format!(
            "gridroute_poisoned_total {}\n",
            self.poisoned_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_value_updates_total Value-table updates applied\n");
        out.push_str("# TYPE gridroute_value_updates_total counter\n");
        out.push_str(&format!(
            "gridroute_value_updates_total {}\n",
            self.value_updates_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_sync_records_total Federation sync results\n");
        out.push_str("# TYPE gridroute_sync_records_total counter\n");
        out.push_str(&format!(
            "gridroute_sync_records_total{{result=\"inserted\"}} {}\n",
            self.sync_inserted_total.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "gridroute_sync_records_total{{result=\"failed\"}} {}\n",
            self.sync_failed_total.load(Ordering::Relaxed)
        ));

        out.push_str("\n# HELP gridroute_decide_latency_seconds Decision latency\n");
        out.push_str("# TYPE gridroute_decide_latency_seconds histogram\n");
        out.push_str(&self.decide_latency.to_prometheus("gridroute_decide_latency_seconds", ""));

        out.push_str("\n# HELP gridroute_feedback_latency_seconds Feedback latency\n");
        out.push_str("# TYPE gridroute_feedback_latency_seconds histogram\n");
        out.push_str(
            &self
                .feedback_latency
                .to_prometheus("gridroute_feedback_latency_seconds", ""),
        );

        out.push_str("\n# HELP gridroute_epsilon Current exploration rate\n");
        out.push_str("# TYPE gridroute_epsilon gauge\n");
        out.push_str(&format!("gridroute_epsilon {}\n", gauges.epsilon));

        out.push_str("\n# HELP gridroute_value_table_pairs Materialized (state, action) pairs\n");
        out.push_str("# TYPE gridroute_value_table_pairs gauge\n");
        out.push_str(&format!(
            "gridroute_value_table_pairs {}\n",
            gauges.value_table_pairs
        ));

        out.push_str("\n# HELP gridroute_value_table_states Known states\n");
        out.push_str("# TYPE gridroute_value_table_states gauge\n");
        out.push_str(&format!(
            "gridroute_value_table_states {}\n",
            gauges.value_table_states
        ));

        out.push_str("\n# HELP gridroute_store_traces Decision traces in the store\n");
        out.push_str("# TYPE gridroute_store_traces gauge\n");
        out.push_str(&format!("gridroute_store_traces {}\n", gauges.store_traces));

        out.push_str("\n# HELP gridroute_store_pending Traces awaiting feedback\n");
        out.push_str("# TYPE gridroute_store_pending gauge\n");
        out.push_str(&format!("gridroute_store_pending {}\n", gauges.store_pending));

        out.push_str("\n# HELP gridroute_signal_cache_hit_rate Adaptive-signal cache hit rate\n");
        out.push_str("# TYPE gridroute_signal_cache_hit_rate gauge\n");
        out.push_str(&format!(
            "gridroute_signal_cache_hit_rate {}\n",
            gauges.signal_hit_rate
        ));

        out.push_str("\n# HELP gridroute_federation_records Records in the federation log\n");
        out.push_str("# TYPE gridroute_federation_records gauge\n");
        out.push_str(&format!(
            "gridroute_federation_records {}\n",
            gauges.federation_records
        ));

        out.push_str("\n# HELP gridroute_providers Providers in the directory\n");
        out.push_str("# TYPE gridroute_providers gauge\n");
        out.push_str(&format!("gridroute_providers {}\n", gauges.providers));

        out
    }
}
