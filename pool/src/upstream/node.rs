use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::time::Duration;

use crate::metrics::prometheus as metrics;

/// JSON-RPC client for the upstream chain node.
pub struct NodeClient {
    base_url: String,
    client: reqwest::Client,
}

impl NodeClient {
    pub fn new(base_url: String) -> Self {
        tracing::info!("node client initialized: {}", base_url);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { base_url, client }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        metrics::inc_rpc_requests();
        let result = self.call_inner(method, params).await;
        if result.is_err() {
            metrics::inc_rpc_errors();
        }
        result
    }

    async fn call_inner(&self, method: &str, params: Value) -> Result<Value> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.base_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("rpc connection failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("rpc http error: {status}"));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow!("rpc body decode failed: {e}"))?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(anyhow!("rpc error: {error}"));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fetch the current work template. Supports both snake_case and
    /// camelCase method spellings, matching older nodes.
    pub async fn get_work_template(&self) -> Result<Value> {
        match self.call("get_work_template", json!({})).await {
            Ok(v) => Ok(v),
            Err(_) => self.call("getWorkTemplate", json!({})).await,
        }
    }

    /// Submit a solved header. Accepts either a bare bool result or an
    /// `{accepted: bool}` object.
    pub async fn submit_work(&self, header_hex: &str) -> Result<bool> {
        let params = json!([header_hex]);
        let result = match self.call("submit_work", params.clone()).await {
            Ok(v) => v,
            Err(_) => self.call("submitWork", params).await?,
        };

        let accepted = if let Some(b) = result.as_bool() {
            b
        } else if let Some(obj) = result.as_object() {
            obj.get("accepted").and_then(|v| v.as_bool()).unwrap_or(false)
        } else {
            false
        };

        if !accepted {
            tracing::error!("submit_work rejected: {:?}", result);
        }
        Ok(accepted)
    }
}
