//! Executor: uniform dispatch contract per provider.
//!
//! The executor sends a normalized request to the chosen provider and records
//! either a dispatch success (with completion handle) or a dispatch failure
//! (with error kind). It never interprets the outcome beyond recording;
//! reward arrives later through feedback. Retries are a caller concern and
//! always use a fresh decision id.

pub mod http;

use crate::models::WorkloadContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpDispatcher;

/// Normalized outbound request. Carries the decision id so asynchronous
/// feedback can be correlated when it arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub decision_id: String,
    pub tenant: String,
    pub provider_id: String,
    pub context: WorkloadContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSuccess {
    /// Provider-issued handle for the running workload.
    pub completion_handle: String,
}

/// Dispatch failure classification. The executor records the kind and moves
/// on; it does not retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    Timeout,
    Connection,
    Rejected,
    Protocol,
}

impl DispatchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Rejected => "rejected",
            Self::Protocol => "protocol",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub kind: DispatchErrorKind,
    pub detail: String,
}

/// Uniform dispatch contract. One implementation per transport; tests inject
/// fakes without touching the router.
#[async_trait]
pub trait ProviderDispatcher: Send + Sync {
    /// Dispatch within the per-provider deadline carried by the
    /// implementation. Exceeding it yields a `Timeout` failure.
    async fn dispatch(
        &self,
        endpoint: Option<&str>,
        request: &DispatchRequest,
    ) -> Result<DispatchSuccess, DispatchFailure>;
}
