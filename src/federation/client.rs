//! Peer client for federation reconciliation.
//!
//! The trait keeps the sync engine transport-agnostic; tests drive it with
//! in-memory fakes and production uses the HTTP implementation against the
//! federation API of a peer node.

use crate::federation::record::MemoryRecord;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Page of record ids in the peer's stable (timestamp, id) order.
    async fn list_memory_ids(&self, limit: usize, after: Option<&str>) -> Result<Vec<String>>;

    /// Fetch one full record.
    async fn get_memory(&self, id: &str) -> Result<MemoryRecord>;

    /// Liveness probe.
    async fn health(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct IdsBody {
    ids: Vec<String>,
}

pub struct HttpPeerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn list_memory_ids(&self, limit: usize, after: Option<&str>) -> Result<Vec<String>> {
        let mut url = format!("{}/federation/memory_ids?limit={}", self.base_url, limit);
        if let Some(after) = after {
            url.push_str(&format!("&after={}", after));
        }
        let body: IdsBody = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("list_memory_ids from {}", self.base_url))?
            .error_for_status()?
            .json()
            .await
            .context("parse memory id list")?;
        Ok(body.ids)
    }

    async fn get_memory(&self, id: &str) -> Result<MemoryRecord> {
        let url = format!("{}/federation/memory/{}", self.base_url, id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("get_memory {} from {}", id, self.base_url))?;
        if !resp.status().is_success() {
            return Err(anyhow!("peer returned {} for {}", resp.status(), id));
        }
        resp.json().await.context("parse memory record")
    }

    async fn health(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
