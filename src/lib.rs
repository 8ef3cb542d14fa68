//! GridRoute Backend Library
//!
//! Adaptive multi-provider routing control plane for GPU compute workloads:
//! the Strategist/Executor/Auditor loop plus federation reconciliation.
//! Exposes core modules for use by binaries and tests.

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod executor;
pub mod federation;
pub mod models;
pub mod policyhost;
pub mod providers;
pub mod router;
pub mod signal;
pub mod store;
pub mod strategist;
pub mod telemetry;

// Re-export the ingress types for convenience
pub use error::RouteError;
pub use router::{DecideRequest, DecideResponse, FeedbackResponse, RouterCore, RouterCoreConfig};
