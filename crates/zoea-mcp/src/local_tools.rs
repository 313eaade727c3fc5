// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Swarm-control tools served by Zoea itself: list/send/broadcast/search/
//! claim-account (spec.md §4.4).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use zoea_store::Store;

use crate::error::McpError;
use crate::registry::ToolRegistry;
use crate::tool::{Tool, ToolResult};

/// Narrow back-reference into the swarm's orchestration layer, implemented
/// by `zoea_swarm::Commander`. Local tools that need to route a message to
/// another pilot (rather than just read the Store) go through this trait
/// instead of depending on `zoea-swarm` directly, which would create a
/// crate dependency cycle.
#[async_trait]
pub trait SwarmControl: Send + Sync {
    async fn send_message(&self, to: &str, content: &str) -> anyhow::Result<()>;
    async fn broadcast(&self, from: &str, content: &str) -> anyhow::Result<()>;
    async fn list_pilots(&self) -> anyhow::Result<Vec<(String, String, String)>>;
}

pub fn build_local_registry(store: Arc<Store>, swarm: Arc<dyn SwarmControl>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ClaimAccountTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(SearchMemoriesTool {
        store: store.clone(),
    }));
    registry.register(Arc::new(SendMessageTool {
        swarm: swarm.clone(),
    }));
    registry.register(Arc::new(BroadcastTool { swarm: swarm.clone() }));
    registry.register(Arc::new(ListPilotsTool { swarm }));
    registry
}

struct ClaimAccountTool {
    store: Arc<Store>,
}

#[async_trait]
impl Tool for ClaimAccountTool {
    fn name(&self) -> &str {
        "zoea_claim_account"
    }
    fn description(&self) -> &str {
        "Claim an unused game account's credentials. Does not log in."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _mysis_id: &str, _args: Value) -> Result<ToolResult, McpError> {
        match self.store.claim_account().await {
            Ok(account) => Ok(ToolResult::ok(
                json!({"username": account.username, "password": account.password}).to_string(),
            )),
            Err(zoea_store::StoreError::NoAccountsAvailable) => {
                Ok(ToolResult::error("no accounts available"))
            }
            Err(e) => Err(e.into()),
        }
    }
}

struct SearchMemoriesTool {
    store: Arc<Store>,
}

#[async_trait]
impl Tool for SearchMemoriesTool {
    fn name(&self) -> &str {
        "zoea_search_memories"
    }
    fn description(&self) -> &str {
        "Search this pilot's own conversation history by substring."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "limit": {"type": "integer"}
            },
            "required": ["query"]
        })
    }
    async fn execute(&self, mysis_id: &str, args: Value) -> Result<ToolResult, McpError> {
        let query = args.get("query").and_then(Value::as_str).unwrap_or("");
        let limit = args.get("limit").and_then(Value::as_i64).unwrap_or(20);
        let hits = self.store.search_memories(mysis_id, query, limit).await?;
        let texts: Vec<&str> = hits.iter().map(|m| m.content.as_str()).collect();
        Ok(ToolResult::ok(json!(texts).to_string()))
    }
}

struct SendMessageTool {
    swarm: Arc<dyn SwarmControl>,
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "zoea_send_message"
    }
    fn description(&self) -> &str {
        "Send a direct message to another pilot by id."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "to": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["to", "content"]
        })
    }
    async fn execute(&self, _mysis_id: &str, args: Value) -> Result<ToolResult, McpError> {
        let to = args.get("to").and_then(Value::as_str).unwrap_or("");
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        match self.swarm.send_message(to, content).await {
            Ok(()) => Ok(ToolResult::ok("sent")),
            Err(e) => Ok(ToolResult::error(format!("send failed: {e}"))),
        }
    }
}

struct BroadcastTool {
    swarm: Arc<dyn SwarmControl>,
}

#[async_trait]
impl Tool for BroadcastTool {
    fn name(&self) -> &str {
        "zoea_broadcast"
    }
    fn description(&self) -> &str {
        "Broadcast a message to every other pilot."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"content": {"type": "string"}},
            "required": ["content"]
        })
    }
    async fn execute(&self, mysis_id: &str, args: Value) -> Result<ToolResult, McpError> {
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        match self.swarm.broadcast(mysis_id, content).await {
            Ok(()) => Ok(ToolResult::ok("broadcast sent")),
            Err(e) => Ok(ToolResult::error(format!("broadcast failed: {e}"))),
        }
    }
}

struct ListPilotsTool {
    swarm: Arc<dyn SwarmControl>,
}

#[async_trait]
impl Tool for ListPilotsTool {
    fn name(&self) -> &str {
        "zoea_list_pilots"
    }
    fn description(&self) -> &str {
        "List every pilot in the swarm with its id and current state."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    async fn execute(&self, _mysis_id: &str, _args: Value) -> Result<ToolResult, McpError> {
        let pilots = self
            .swarm
            .list_pilots()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        let rendered: Vec<Value> = pilots
            .into_iter()
            .map(|(id, name, state)| json!({"id": id, "name": name, "state": state}))
            .collect();
        Ok(ToolResult::ok(json!(rendered).to_string()))
    }
}
