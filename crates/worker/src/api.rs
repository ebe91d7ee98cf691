//! The REST client the worker uses against the control plane.

use anyhow::{anyhow, Result};
use chrono::Utc;
use hive_types::node::{NodeCapacity, NodeStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Serialize)]
struct RegisterRequest<'a> {
    node_id: &'a str,
    metadata: &'a BTreeMap<String, serde_json::Value>,
    capacity: &'a NodeCapacity,
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    status: &'a NodeStatus,
    timestamp: chrono::DateTime<Utc>,
}

/// A thin client for `/v1/nodes:register` and `/v1/nodes/{id}:heartbeat`.
#[derive(Debug, Clone)]
pub struct ControlPlaneApi {
    http: reqwest::Client,
    base_url: String,
}

impl ControlPlaneApi {
    /// Builds the client against `base_url` (no trailing slash required).
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Registers this node. The worker exits non-zero when this fails.
    pub async fn register(
        &self,
        node_id: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
        capacity: &NodeCapacity,
    ) -> Result<()> {
        let url = format!("{}/v1/nodes:register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&RegisterRequest { node_id, metadata, capacity })
            .send()
            .await
            .map_err(|e| anyhow!("registration request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("registration rejected with {status}: {body}"));
        }
        Ok(())
    }

    /// Sends one heartbeat with the node's current status.
    pub async fn heartbeat(&self, node_id: &str, status: &NodeStatus) -> Result<()> {
        let url = format!("{}/v1/nodes/{}:heartbeat", self.base_url, node_id);
        let response = self
            .http
            .post(&url)
            .json(&HeartbeatRequest { status, timestamp: Utc::now() })
            .send()
            .await
            .map_err(|e| anyhow!("heartbeat request failed: {e}"))?;
        let code = response.status();
        if !code.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("heartbeat rejected with {code}: {body}"));
        }
        Ok(())
    }
}
