// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios S1-S6 driven through the public `Commander`/`Mysis`
//! surface, against an in-memory store and scripted fakes for the provider
//! and upstream MCP transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use zoea_config::{Config, McpConfig, ProviderConfig, SwarmConfig};
use zoea_mcp::{McpProxy, ToolResult, UpstreamTransport};
use zoea_provider::{ChatResult, Message, Provider, ProviderError, ResponseStream, ToolCall, ToolSchema};
use zoea_store::{MysisState, Store};
use zoea_swarm::Commander;

fn test_config() -> Arc<Config> {
    let mut providers = std::collections::BTreeMap::new();
    providers.insert(
        "fake".to_string(),
        ProviderConfig {
            endpoint: "http://localhost:11434/v1".into(),
            model: "llama3".into(),
            temperature: 0.2,
            rate_limit: 6000,
            rate_burst: 500,
        },
    );
    Arc::new(Config {
        providers,
        mcp: McpConfig {
            upstream: None,
            enabled: false,
        },
        swarm: SwarmConfig {
            max_myses: 16,
            max_tool_iterations: 8,
            idle_nudge_seconds: 3600,
            llm_request_timeout_seconds: 30,
            max_context_messages: 60,
        },
    })
}

async fn new_commander() -> Arc<Commander> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let events = Arc::new(zoea_events::EventBus::new(64));
    let registry = zoea_mcp::build_local_registry(store.clone(), Arc::new(NullSwarm));
    let mcp = Arc::new(McpProxy::new(registry, None, store.clone()));
    Commander::new(store, events, mcp, test_config(), Arc::new(zoea_config::Credentials::default()))
}

struct NullSwarm;
#[async_trait]
impl zoea_mcp::SwarmControl for NullSwarm {
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

/// A provider whose `chat_with_tools` blocks for a fixed delay, then
/// errors — models a model timing out after `Stop()` has already been
/// requested (S1).
struct SlowThenErrorProvider {
    delay: Duration,
}

#[async_trait]
impl Provider for SlowThenErrorProvider {
    fn name(&self) -> &str {
        "slow"
    }
    async fn chat(&self, _m: &[Message], _c: &CancellationToken) -> Result<String, ProviderError> {
        Ok(String::new())
    }
    async fn chat_with_tools(
        &self,
        _messages: &[Message],
        _tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<ChatResult, ProviderError> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Err(ProviderError::Transient("simulated failure".into())),
            _ = cancel.cancelled() => Err(ProviderError::Canceled),
        }
    }
    async fn stream(&self, _m: &[Message], _c: &CancellationToken) -> Result<ResponseStream, ProviderError> {
        unimplemented!()
    }
    async fn close(&self) {}
}

/// S1 — stopping mid-turn swallows the in-flight failure instead of
/// letting it flip the pilot to `errored`.
#[tokio::test]
async fn s1_stop_during_turn_swallows_cancellation() {
    let commander = new_commander().await;
    let mysis = commander
        .create_mysis("Scout", "fake", "llama3", "you are a pilot")
        .await
        .unwrap();
    // Swap in the slow provider by hand since Commander always builds a
    // real OpenAICompatProvider from config; exercise the pilot directly.
    mysis
        .configure(
            Arc::new(SlowThenErrorProvider { delay: Duration::from_secs(2) }),
            "fake",
            "llama3",
            0.2,
        )
        .await
        .unwrap();

    mysis.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = tokio::time::timeout(Duration::from_secs(5), mysis.stop()).await;
    assert!(stopped.is_ok(), "Stop() did not return within 5s");
    stopped.unwrap().unwrap();

    assert_eq!(mysis.state(), MysisState::Stopped);
    assert!(mysis.last_error().is_none());
}

/// A scripted provider for S2: on the first turn it calls
/// `zoea_claim_account`; once it observes a tool result carrying a
/// `username`, it calls `login` with that username; afterward it stops
/// calling tools so the turn (and the run-loop, once started in isolation)
/// settles.
struct ClaimThenLoginProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl Provider for ClaimThenLoginProvider {
    fn name(&self) -> &str {
        "claim-then-login"
    }
    async fn chat(&self, _m: &[Message], _c: &CancellationToken) -> Result<String, ProviderError> {
        Ok(String::new())
    }
    async fn chat_with_tools(
        &self,
        messages: &[Message],
        _tools: &[ToolSchema],
        _cancel: &CancellationToken,
    ) -> Result<ChatResult, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            return Ok(ChatResult {
                text: None,
                tool_calls: vec![ToolCall {
                    id: "t1".into(),
                    name: "zoea_claim_account".into(),
                    arguments: json!({}),
                }],
            });
        }
        let claimed_username = messages.iter().find_map(|m| {
            let content = m.content.as_deref()?;
            let parsed: Value = serde_json::from_str(content).ok()?;
            parsed.get("username")?.as_str().map(str::to_string)
        });
        if let Some(username) = claimed_username {
            if n == 1 {
                return Ok(ChatResult {
                    text: None,
                    tool_calls: vec![ToolCall {
                        id: "t2".into(),
                        name: "login".into(),
                        arguments: json!({"username": username, "password": "pw"}),
                    }],
                });
            }
        }
        Ok(ChatResult { text: Some("done".into()), tool_calls: vec![] })
    }
    async fn stream(&self, _m: &[Message], _c: &CancellationToken) -> Result<ResponseStream, ProviderError> {
        unimplemented!()
    }
    async fn close(&self) {}
}

struct FakeLoginUpstream;

#[async_trait]
impl UpstreamTransport for FakeLoginUpstream {
    async fn initialize(&self) -> Result<(), zoea_mcp::McpError> {
        Ok(())
    }
    async fn list_tools(&self) -> Result<Vec<(String, String, Value)>, zoea_mcp::McpError> {
        Ok(vec![("login".into(), "log in".into(), json!({}))])
    }
    async fn call_tool(&self, name: &str, _args: Value) -> Result<ToolResult, zoea_mcp::McpError> {
        match name {
            "login" => Ok(ToolResult::ok("logged in")),
            _ => Ok(ToolResult::error("no such tool")),
        }
    }
}

/// S2 — two pilots racing to claim and log into the same single account:
/// exactly one account, and it ends up `in_use` for exactly one pilot.
#[tokio::test]
async fn s2_account_single_holder() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    store.create_account("u1", "pw").await.unwrap();
    let events = Arc::new(zoea_events::EventBus::new(64));
    let registry = zoea_mcp::build_local_registry(store.clone(), Arc::new(NullSwarm));
    let mcp = Arc::new(McpProxy::new(registry, Some(Arc::new(FakeLoginUpstream)), store.clone()));
    mcp.initialize().await.unwrap();
    let commander = Commander::new(
        store.clone(),
        events,
        mcp,
        test_config(),
        Arc::new(zoea_config::Credentials::default()),
    );

    let a = commander.create_mysis("A", "fake", "llama3", "sys").await.unwrap();
    let b = commander.create_mysis("B", "fake", "llama3", "sys").await.unwrap();
    a.configure(Arc::new(ClaimThenLoginProvider { calls: AtomicUsize::new(0) }), "fake", "llama3", 0.2)
        .await
        .unwrap();
    b.configure(Arc::new(ClaimThenLoginProvider { calls: AtomicUsize::new(0) }), "fake", "llama3", 0.2)
        .await
        .unwrap();

    a.start().await.unwrap();
    b.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    a.stop().await.unwrap();
    b.stop().await.unwrap();

    let account = store.claim_account().await;
    // Exactly one pilot holds the account: the other sees "no accounts
    // available" and claim_account (used here as a probe) fails.
    assert!(account.is_err(), "expected the single account to still be in use");
}

/// S5 — five pilots under broadcast load all reach `stopped` within the
/// 10s `StopAll` deadline, never `errored`.
#[tokio::test]
async fn s5_graceful_shutdown_under_load() {
    let commander = new_commander().await;
    let mut pilots = Vec::new();
    for i in 0..5 {
        let mysis = commander
            .create_mysis(&format!("Pilot{i}"), "fake", "llama3", "sys")
            .await
            .unwrap();
        mysis
            .configure(
                Arc::new(ClaimThenLoginProvider { calls: AtomicUsize::new(0) }),
                "fake",
                "llama3",
                0.2,
            )
            .await
            .unwrap();
        mysis.start().await.unwrap();
        pilots.push(mysis);
    }

    for i in 0..3 {
        commander
            .broadcast(pilots[0].id(), &format!("broadcast {i}"))
            .await
            .unwrap();
    }

    let result = tokio::time::timeout(Duration::from_secs(10), commander.stop_all()).await;
    assert!(result.is_ok(), "StopAll did not return within 10s");
    result.unwrap().unwrap();

    for mysis in &pilots {
        assert_eq!(mysis.state(), MysisState::Stopped);
    }
}
