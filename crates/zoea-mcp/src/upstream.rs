// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Upstream MCP transport: a JSON-RPC 2.0 client over HTTP, and an offline
//! stub backend for running without a live upstream server.
//!
//! The retrieval pack's only `rmcp` usage is server-side
//! (`ServiceExt::serve`); no client-transport example exists to ground a
//! real `rmcp` client here, so the upstream leg is a small hand-rolled
//! JSON-RPC client on `reqwest` + `serde_json`, both already in the
//! dependency stack (see DESIGN.md).

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::McpError;
use crate::tool::ToolResult;

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn initialize(&self) -> Result<(), McpError>;
    async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, McpError>;
    /// Single call attempt, no retry — retry policy lives in `McpProxy`.
    /// Returns `Err` only for transient transport failures; a tool-level
    /// error is a normal `Ok(ToolResult { is_error: true, .. })`.
    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, McpError>;
}

/// JSON-RPC 2.0 client: `initialize`, `tools/list`, `tools/call` (spec.md §6).
pub struct UpstreamClient {
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!("http {}", resp.status())));
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|e| McpError::Malformed(e.to_string()))?;
        if let Some(error) = value.get("error") {
            return Err(McpError::Malformed(error.to_string()));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| McpError::Malformed("missing result field".into()))
    }
}

#[async_trait]
impl UpstreamTransport for UpstreamClient {
    async fn initialize(&self) -> Result<(), McpError> {
        self.rpc("initialize", json!({})).await.map(|_| ())
    }

    async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, McpError> {
        let result = self.rpc("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| McpError::Malformed("missing tools array".into()))?;
        Ok(tools
            .iter()
            .filter_map(|t| {
                let name = t.get("name")?.as_str()?.to_string();
                let description = t
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let schema = t.get("inputSchema").cloned().unwrap_or(json!({}));
                Some((name, description, schema))
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<ToolResult, McpError> {
        let result = self
            .rpc("tools/call", json!({"name": name, "arguments": args}))
            .await?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|parts| parts.first())
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ToolResult { content, is_error })
    }
}

/// Deterministic stub backend for `--offline` mode (spec.md §4.4).
pub struct OfflineBackend;

#[async_trait]
impl UpstreamTransport for OfflineBackend {
    async fn initialize(&self) -> Result<(), McpError> {
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, McpError> {
        Ok(vec![
            ("get_status".into(), "Get pilot status".into(), json!({})),
            ("get_system".into(), "Get current star system".into(), json!({})),
            ("get_ship".into(), "Get ship details".into(), json!({})),
            ("get_poi".into(), "Get points of interest".into(), json!({})),
        ])
    }

    async fn call_tool(&self, name: &str, _args: Value) -> Result<ToolResult, McpError> {
        let body = match name {
            "get_status" => json!({"status": "idle", "fuel": 100, "hull": 100}),
            "get_system" => json!({"system": "offline-sector-1", "planets": 3}),
            "get_ship" => json!({"ship": "scout-mk1", "cargo": []}),
            "get_poi" => json!({"points_of_interest": []}),
            _ => {
                return Ok(ToolResult::error(format!(
                    "offline mode: tool '{name}' is not available without an upstream server"
                )))
            }
        };
        Ok(ToolResult::ok(body.to_string()))
    }
}
