//! HTTP dispatcher: POSTs the normalized request to the provider endpoint.

use super::{
    DispatchErrorKind, DispatchFailure, DispatchRequest, DispatchSuccess, ProviderDispatcher,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    accepted: Option<bool>,
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    deadline: Duration,
}

impl HttpDispatcher {
    pub fn new(deadline: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .expect("reqwest client construction");
        Self { client, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

#[async_trait]
impl ProviderDispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        endpoint: Option<&str>,
        request: &DispatchRequest,
    ) -> Result<DispatchSuccess, DispatchFailure> {
        let endpoint = endpoint.ok_or_else(|| DispatchFailure {
            kind: DispatchErrorKind::Rejected,
            detail: format!("provider {} has no dispatch endpoint", request.provider_id),
        })?;

        let url = format!("{}/dispatch", endpoint.trim_end_matches('/'));
        debug!(provider = %request.provider_id, %url, decision_id = %request.decision_id, "dispatching");

        let resp = self.client.post(&url).json(request).send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                DispatchErrorKind::Timeout
            } else if e.is_connect() {
                DispatchErrorKind::Connection
            } else {
                DispatchErrorKind::Protocol
            };
            DispatchFailure {
                kind,
                detail: e.to_string(),
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DispatchFailure {
                kind: DispatchErrorKind::Rejected,
                detail: format!("provider returned {}", status),
            });
        }

        let body: DispatchResponse = resp.json().await.map_err(|e| DispatchFailure {
            kind: DispatchErrorKind::Protocol,
            detail: format!("malformed dispatch response: {}", e),
        })?;

        if body.accepted == Some(false) {
            return Err(DispatchFailure {
                kind: DispatchErrorKind::Rejected,
                detail: "provider declined the workload".to_string(),
            });
        }

        Ok(DispatchSuccess {
            completion_handle: body
                .handle
                .unwrap_or_else(|| format!("pending-{}", request.decision_id)),
        })
    }
}
