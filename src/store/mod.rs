//! Durable stores: record framing and the decision store.

pub mod decisions;
pub mod framing;

pub use decisions::{DecisionStore, DecisionTrace, DispatchRecord, StoreStats, TraceStatus};
