//! Typed errors crossing the API boundary.
//!
//! Every error is classified at the boundary into one of a fixed set of
//! kinds; stack traces and internal details never leak to callers. Retries
//! are only sensible for `UpstreamTimeout`, and only at the caller's
//! discretion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Boundary error kinds for the routing control plane.
#[derive(Debug, Clone)]
pub enum RouteError {
    /// Context or constraints malformed.
    InvalidInput(String),
    /// The candidate filter left nothing to choose from.
    NoViableProviders,
    /// Hard reject from the policy host, with the module's reason.
    PolicyReject(String),
    /// Second feedback for a decision; carries the prior reward.
    AlreadyFinalized { decision_id: String, reward: f64 },
    /// Feedback for a decision id not in the store.
    UnknownDecision(String),
    /// Signal source, executor dispatch, or policy host exceeded its deadline.
    UpstreamTimeout(String),
    /// Federation id collision, surfaced with winner/loser references.
    Conflict { winner: String, loser: String },
    /// Persistence checksum failure. Operator-visible, fail-closed.
    Corruption(String),
    /// Ingress queue overflow; fast-fail so callers can shed load.
    Overloaded(&'static str),
}

impl RouteError {
    /// Stable machine-readable kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NoViableProviders => "no_viable_providers",
            Self::PolicyReject(_) => "policy_reject",
            Self::AlreadyFinalized { .. } => "already_finalized",
            Self::UnknownDecision(_) => "unknown_decision",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::Conflict { .. } => "conflict",
            Self::Corruption(_) => "corruption",
            Self::Overloaded(_) => "overloaded",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::NoViableProviders => StatusCode::CONFLICT,
            Self::PolicyReject(_) => StatusCode::FORBIDDEN,
            Self::AlreadyFinalized { .. } => StatusCode::CONFLICT,
            Self::UnknownDecision(_) => StatusCode::NOT_FOUND,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Corruption(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            Self::NoViableProviders => write!(f, "no viable providers after filtering"),
            Self::PolicyReject(reason) => write!(f, "policy reject: {}", reason),
            Self::AlreadyFinalized { decision_id, reward } => {
                write!(f, "decision {} already finalized (reward {})", decision_id, reward)
            }
            Self::UnknownDecision(id) => write!(f, "unknown decision: {}", id),
            Self::UpstreamTimeout(what) => write!(f, "upstream timeout: {}", what),
            Self::Conflict { winner, loser } => {
                write!(f, "conflict resolved: winner={} loser={}", winner, loser)
            }
            Self::Corruption(what) => write!(f, "persistence corruption: {}", what),
            Self::Overloaded(op) => write!(f, "ingress queue full for {}", op),
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Serialize)]
struct ErrorBody {
    reason: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reward: Option<f64>,
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        let reward = match &self {
            Self::AlreadyFinalized { reward, .. } => Some(*reward),
            _ => None,
        };
        let body = ErrorBody {
            reason: self.kind(),
            detail: self.to_string(),
            reward,
        };
        (self.status_code(), Json(body)).into_response()
    }
}
