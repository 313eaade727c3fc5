// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zoea_store::Store;

use crate::error::McpError;
use crate::registry::ToolRegistry;
use crate::rewrite::rewrite_tool_error;
use crate::tool::ToolResult;
use crate::upstream::UpstreamTransport;

/// Fixed backoff schedule for transient upstream failures (spec.md §4.4).
const RETRY_BACKOFF: &[Duration] = &[
    Duration::from_millis(100),
    Duration::from_millis(300),
    Duration::from_secs(1),
];

/// Aggregates local tools with upstream tools fetched via `tools/list`.
pub struct McpProxy {
    local: ToolRegistry,
    upstream: Option<Arc<dyn UpstreamTransport>>,
    upstream_tools: RwLock<Vec<(String, String, Value)>>,
    store: Arc<Store>,
}

impl McpProxy {
    pub fn new(
        local: ToolRegistry,
        upstream: Option<Arc<dyn UpstreamTransport>>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            local,
            upstream,
            upstream_tools: RwLock::new(Vec::new()),
            store,
        }
    }

    /// Fetch and cache the upstream tool list. Idempotent; safe to call
    /// more than once (eager initialization happens at startup).
    pub async fn initialize(&self) -> Result<(), McpError> {
        let Some(upstream) = &self.upstream else {
            return Ok(());
        };
        upstream.initialize().await?;
        let tools = upstream.list_tools().await?;
        *self.upstream_tools.write().await = tools;
        Ok(())
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn local_tool_count(&self) -> usize {
        self.local.len()
    }

    /// Union of local and cached upstream tool schemas.
    pub async fn list_tools(&self) -> Vec<(String, String, Value)> {
        let mut out: Vec<(String, String, Value)> = self
            .local
            .schemas()
            .into_iter()
            .map(|(name, desc, schema)| (name, desc, schema))
            .collect();
        out.extend(self.upstream_tools.read().await.iter().cloned());
        out
    }

    pub async fn call_tool(
        &self,
        mysis_id: &str,
        name: &str,
        args: Value,
    ) -> Result<ToolResult, McpError> {
        if self.local.contains(name) {
            return self.local.execute(name, mysis_id, args).await;
        }

        let Some(upstream) = &self.upstream else {
            return Err(McpError::UnknownTool(name.to_string()));
        };

        let result = self.call_with_retry(upstream.as_ref(), name, args.clone()).await?;
        self.intercept_auth(name, &args, &result).await?;

        if result.is_error {
            return Ok(ToolResult::error(rewrite_tool_error(&result.content)));
        }
        Ok(result)
    }

    async fn call_with_retry(
        &self,
        upstream: &dyn UpstreamTransport,
        name: &str,
        args: Value,
    ) -> Result<ToolResult, McpError> {
        let mut last_err = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO)
            .chain(RETRY_BACKOFF.iter().copied())
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }
            match upstream.call_tool(name, args.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(tool = name, attempt, error = %e, "transient upstream failure");
                    last_err = Some(e);
                }
            }
        }
        let _ = last_err;
        Err(McpError::ToolRetryExhausted {
            tool: name.to_string(),
        })
    }

    /// On a successful `login`/`register` call, mark the account in use; on
    /// a successful `logout`, release it. This is the sole mechanism that
    /// flips accounts to `in_use=1` (spec.md §4.4).
    async fn intercept_auth(
        &self,
        name: &str,
        args: &Value,
        result: &ToolResult,
    ) -> Result<(), McpError> {
        if result.is_error {
            return Ok(());
        }
        let username = args.get("username").and_then(Value::as_str);
        match (name, username) {
            ("login", Some(username)) | ("register", Some(username)) => {
                debug!(username, "marking account in use after successful login");
                self.store.mark_account_in_use(username).await?;
            }
            ("logout", Some(username)) => {
                debug!(username, "releasing account after logout");
                self.store.release_account(username).await?;
            }
            _ => {}
        }
        Ok(())
    }

    pub async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_tools::{build_local_registry, SwarmControl};
    use crate::upstream::OfflineBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSwarm;

    #[async_trait]
    impl SwarmControl for FakeSwarm {
        async fn send_message(&self, _to: &str, _content: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn broadcast(&self, _from: &str, _content: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn list_pilots(&self) -> anyhow::Result<Vec<(String, String, String)>> {
            Ok(vec![])
        }
    }

    async fn proxy_with_offline() -> (McpProxy, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let local = build_local_registry(store.clone(), Arc::new(FakeSwarm));
        let proxy = McpProxy::new(local, Some(Arc::new(OfflineBackend)), store.clone());
        proxy.initialize().await.unwrap();
        (proxy, store)
    }

    #[tokio::test]
    async fn local_tools_take_precedence_over_upstream() {
        let (proxy, _store) = proxy_with_offline().await;
        let result = proxy
            .call_tool("m1", "zoea_claim_account", Value::Null)
            .await
            .unwrap();
        assert!(result.is_error); // no accounts seeded
    }

    #[tokio::test]
    async fn unknown_upstream_tool_in_offline_mode_is_tool_error_not_proxy_error() {
        let (proxy, _store) = proxy_with_offline().await;
        let result = proxy.call_tool("m1", "get_status", json!({})).await.unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn session_required_error_is_rewritten() {
        struct Flaky;
        #[async_trait]
        impl UpstreamTransport for Flaky {
            async fn initialize(&self) -> Result<(), McpError> {
                Ok(())
            }
            async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, McpError> {
                Ok(vec![])
            }
            async fn call_tool(&self, _name: &str, _args: Value) -> Result<ToolResult, McpError> {
                Ok(ToolResult::error(
                    "session_required: no session. Get one by calling login() or register() first.",
                ))
            }
        }

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let local = build_local_registry(store.clone(), Arc::new(FakeSwarm));
        let proxy = McpProxy::new(local, Some(Arc::new(Flaky)), store);
        let result = proxy.call_tool("m1", "get_status", json!({})).await.unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("Check your recent tool results for session_id"));
        assert!(!result.content.contains("Get one by calling login() or register() first."));
    }

    #[tokio::test]
    async fn transient_failures_retry_then_exhaust() {
        struct AlwaysFails(AtomicUsize);
        #[async_trait]
        impl UpstreamTransport for AlwaysFails {
            async fn initialize(&self) -> Result<(), McpError> {
                Ok(())
            }
            async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, McpError> {
                Ok(vec![])
            }
            async fn call_tool(&self, _name: &str, _args: Value) -> Result<ToolResult, McpError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(McpError::Transport("connection reset".into()))
            }
        }

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let local = build_local_registry(store.clone(), Arc::new(FakeSwarm));
        let backend = Arc::new(AlwaysFails(AtomicUsize::new(0)));
        let proxy = McpProxy::new(local, Some(backend.clone()), store);
        let result = proxy.call_tool("m1", "get_status", json!({})).await;
        assert!(matches!(result, Err(McpError::ToolRetryExhausted { .. })));
        assert_eq!(backend.0.load(Ordering::SeqCst), 1 + RETRY_BACKOFF.len());
    }

    #[tokio::test]
    async fn successful_login_marks_account_in_use() {
        struct LoginOk;
        #[async_trait]
        impl UpstreamTransport for LoginOk {
            async fn initialize(&self) -> Result<(), McpError> {
                Ok(())
            }
            async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, McpError> {
                Ok(vec![])
            }
            async fn call_tool(&self, _name: &str, _args: Value) -> Result<ToolResult, McpError> {
                Ok(ToolResult::ok("{\"session_id\":\"abc\"}"))
            }
        }

        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store.create_account("pilot1", "pw").await.unwrap();
        let local = build_local_registry(store.clone(), Arc::new(FakeSwarm));
        let proxy = McpProxy::new(local, Some(Arc::new(LoginOk)), store.clone());
        proxy
            .call_tool("m1", "login", json!({"username": "pilot1", "password": "pw"}))
            .await
            .unwrap();
        let claimed = store.claim_account().await;
        assert!(matches!(claimed, Err(zoea_store::StoreError::NoAccountsAvailable)));
    }
}
