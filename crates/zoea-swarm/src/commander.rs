// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Registry of pilots, message routing, and orchestrated shutdown
//! (spec.md §4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use zoea_config::{Config, Credentials};
use zoea_events::EventBus;
use zoea_mcp::{McpProxy, SwarmControl};
use zoea_provider::ProviderFactory;
use zoea_store::{MysisState, Role, Source, Store};

use crate::error::SwarmError;
use crate::mysis::Mysis;
use crate::waitgroup::WaitGroup;

/// Bound on `StopAll`'s total wait for every pilot's run-loop to exit.
const STOP_ALL_DEADLINE: Duration = Duration::from_secs(10);

pub struct Commander {
    store: Arc<Store>,
    events: Arc<EventBus>,
    mcp: Arc<McpProxy>,
    config: Arc<Config>,
    credentials: Arc<Credentials>,
    provider_factory: Arc<ProviderFactory>,
    myses: RwLock<HashMap<String, Arc<Mysis>>>,
    waitgroup: WaitGroup,
}

impl Commander {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        mcp: Arc<McpProxy>,
        config: Arc<Config>,
        credentials: Arc<Credentials>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            mcp,
            config,
            credentials,
            provider_factory: Arc::new(ProviderFactory::new()),
            myses: RwLock::new(HashMap::new()),
            waitgroup: WaitGroup::new(),
        })
    }

    /// Rebuild the in-memory registry from the Store on startup. Any pilot
    /// persisted as `running` or `errored` is reset to `idle` — a fresh
    /// process has no live run-loop for it yet, and on-disk state outlives
    /// any one process's threads.
    pub async fn load_myses(&self) -> Result<(), SwarmError> {
        for record in self.store.list_myses().await? {
            let reset_state = match record.state {
                MysisState::Running | MysisState::Errored => {
                    self.store.update_mysis_state(&record.id, MysisState::Idle).await?;
                    MysisState::Idle
                }
                other => other,
            };
            let provider = self.build_provider(&record.provider_key, &record.model, record.temperature)?;
            let mysis = self.new_mysis_handle(record.id.clone(), record.name, reset_state, provider);
            self.myses.write().await.insert(record.id, mysis);
        }
        Ok(())
    }

    fn build_provider(
        &self,
        provider_key: &str,
        model: &str,
        temperature: f32,
    ) -> Result<Arc<dyn zoea_provider::Provider>, SwarmError> {
        let provider_cfg = self
            .config
            .providers
            .get(provider_key)
            .ok_or_else(|| SwarmError::UnknownProvider(provider_key.to_string()))?;
        let auth_style = match provider_cfg.kind() {
            zoea_config::ProviderKind::Ollama => zoea_provider::AuthStyle::None,
            zoea_config::ProviderKind::OpenAiCompatible => zoea_provider::AuthStyle::Bearer,
        };
        let api_key = self.credentials.get_api_key(provider_key).map(str::to_string);
        Ok(self.provider_factory.build(
            provider_key,
            provider_cfg.endpoint.clone(),
            api_key,
            model.to_string(),
            temperature,
            provider_cfg.rate_limit,
            provider_cfg.rate_burst,
            auth_style,
        ))
    }

    fn new_mysis_handle(
        &self,
        id: String,
        name: String,
        state: MysisState,
        provider: Arc<dyn zoea_provider::Provider>,
    ) -> Arc<Mysis> {
        Mysis::new(
            id,
            name,
            state,
            self.store.clone(),
            self.events.clone(),
            self.mcp.clone(),
            provider,
            self.waitgroup.clone(),
            self.config.swarm.max_tool_iterations,
            Duration::from_secs(self.config.swarm.idle_nudge_seconds),
            Duration::from_secs(self.config.swarm.llm_request_timeout_seconds),
            self.config.swarm.max_context_messages,
        )
    }

    pub async fn create_mysis(
        &self,
        name: &str,
        provider_key: &str,
        model: &str,
        system_prompt: &str,
    ) -> Result<Arc<Mysis>, SwarmError> {
        if self.store.count_myses().await? as usize >= self.config.swarm.max_myses {
            return Err(SwarmError::AtCapacity(self.config.swarm.max_myses));
        }
        let provider_cfg_temperature = self
            .config
            .providers
            .get(provider_key)
            .map(|p| p.temperature)
            .unwrap_or(0.2);
        let provider = self.build_provider(provider_key, model, provider_cfg_temperature)?;

        let id = Uuid::new_v4().to_string();
        let record = self
            .store
            .create_mysis(&id, name, provider_key, model, provider_cfg_temperature)
            .await
            .map_err(|e| match &e {
                zoea_store::StoreError::Sqlite(sql_err)
                    if sql_err.to_string().to_uppercase().contains("UNIQUE") =>
                {
                    SwarmError::DuplicateName(name.to_string())
                }
                _ => SwarmError::Store(e),
            })?;
        self.store
            .add_memory(&id, Role::System, Source::System, system_prompt, None, None)
            .await?;

        let mysis = self.new_mysis_handle(record.id.clone(), record.name, MysisState::Idle, provider);
        self.myses.write().await.insert(id, mysis.clone());
        Ok(mysis)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Mysis>, SwarmError> {
        self.myses
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SwarmError::MysisNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<Arc<Mysis>> {
        self.myses.read().await.values().cloned().collect()
    }

    pub async fn delete(&self, id: &str) -> Result<(), SwarmError> {
        let mysis = self.get(id).await?;
        if mysis.has_run_loop() {
            mysis.stop().await?;
        }
        self.store.delete_mysis(id).await?;
        self.myses.write().await.remove(id);
        Ok(())
    }

    pub async fn start_mysis(&self, id: &str) -> Result<(), SwarmError> {
        self.get(id).await?.start().await
    }

    pub async fn stop_mysis(&self, id: &str) -> Result<(), SwarmError> {
        self.get(id).await?.stop().await
    }

    pub async fn relaunch_mysis(&self, id: &str) -> Result<(), SwarmError> {
        self.get(id).await?.start().await
    }

    pub async fn configure_mysis(
        &self,
        id: &str,
        provider_key: &str,
        model: &str,
        temperature: f32,
    ) -> Result<(), SwarmError> {
        let mysis = self.get(id).await?;
        let provider = self.build_provider(provider_key, model, temperature)?;
        mysis.configure(provider, provider_key, model, temperature).await
    }

    /// Append a direct message to `to`'s memory log and wake its run-loop.
    pub async fn send_message(&self, from: Option<&str>, to: &str, content: &str) -> Result<(), SwarmError> {
        let target = self.get(to).await?;
        self.store
            .add_memory(to, Role::User, Source::Direct, content, from, None)
            .await?;
        target.notify();
        Ok(())
    }

    /// Deliver `content` to every pilot other than `from`, in `{idle,
    /// running}`. An idle pilot with no live run-loop is started first so
    /// it can actually pick the broadcast up (spec.md §4.7).
    pub async fn broadcast(&self, from: &str, content: &str) -> Result<(), SwarmError> {
        let targets: Vec<Arc<Mysis>> = self
            .myses
            .read()
            .await
            .values()
            .filter(|m| m.id() != from)
            .filter(|m| matches!(m.state(), MysisState::Idle | MysisState::Running))
            .cloned()
            .collect();

        for target in targets {
            self.store
                .add_memory(target.id(), Role::User, Source::Broadcast, content, Some(from), None)
                .await?;
            if !target.has_run_loop() {
                target.start().await?;
            } else {
                target.notify();
            }
        }
        Ok(())
    }

    /// Stop every pilot, bounded overall by a single `STOP_ALL_DEADLINE`.
    /// Best effort on timeout: logs and returns rather than hanging
    /// forever, but every pilot's `.stop()` is attempted regardless — a
    /// slow pilot never prevents the rest from even being asked to stop.
    pub async fn stop_all(&self) -> Result<(), SwarmError> {
        let targets: Vec<Arc<Mysis>> = self.myses.read().await.values().cloned().collect();
        let deadline = tokio::time::Instant::now() + STOP_ALL_DEADLINE;

        let mut stopping = tokio::task::JoinSet::new();
        for target in targets {
            stopping.spawn(async move {
                if let Err(e) = target.stop().await {
                    warn!(mysis = %target.id(), error = %e, "error stopping pilot during shutdown");
                }
            });
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let drain_all = async { while stopping.join_next().await.is_some() {} };
        if tokio::time::timeout(remaining, drain_all).await.is_err() {
            warn!("stop_all exceeded its stop budget for some pilots, proceeding to wait on waitgroup anyway");
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if !self.waitgroup.wait(remaining).await {
            warn!("stop_all hit its 10s deadline with run-loops still exiting; continuing shutdown");
        }
        info!("all pilots stopped");
        Ok(())
    }
}

#[async_trait]
impl SwarmControl for Commander {
    async fn send_message(&self, to: &str, content: &str) -> anyhow::Result<()> {
        Commander::send_message(self, None, to, content).await?;
        Ok(())
    }

    async fn broadcast(&self, from: &str, content: &str) -> anyhow::Result<()> {
        Commander::broadcast(self, from, content).await?;
        Ok(())
    }

    async fn list_pilots(&self) -> anyhow::Result<Vec<(String, String, String)>> {
        let snapshot = self.myses.read().await;
        Ok(snapshot
            .values()
            .map(|m| (m.id().to_string(), m.name().to_string(), m.state().as_str().to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use zoea_mcp::build_local_registry;
    use zoea_provider::AuthStyle;

    fn test_config() -> Arc<Config> {
        let mut providers = std::collections::BTreeMap::new();
        providers.insert(
            "ollama".to_string(),
            zoea_config::ProviderConfig {
                endpoint: "http://localhost:11434/v1".into(),
                model: "llama3".into(),
                temperature: 0.2,
                rate_limit: 600,
                rate_burst: 50,
            },
        );
        Arc::new(Config {
            providers,
            mcp: Default::default(),
            swarm: zoea_config::SwarmConfig {
                max_myses: 4,
                max_tool_iterations: 8,
                idle_nudge_seconds: 30,
                llm_request_timeout_seconds: 30,
                max_context_messages: 60,
            },
        })
    }

    async fn new_commander() -> Arc<Commander> {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let events = Arc::new(EventBus::new(32));
        let config = test_config();
        let credentials = Arc::new(Credentials::default());
        // A Commander needs an McpProxy; it wires `build_local_registry`
        // with itself once the registry exists, but that is a cycle we
        // resolve at startup time (see `zoea-nova`'s main): tests here
        // only need a store-backed registry without swarm-control tools.
        struct NoopSwarm;
        #[async_trait]
        impl SwarmControl for NoopSwarm {
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
        let registry = build_local_registry(store.clone(), Arc::new(NoopSwarm));
        let mcp = Arc::new(McpProxy::new(registry, None, store.clone()));
        Commander::new(store, events, mcp, config, credentials)
    }

    #[tokio::test]
    async fn create_then_list_roundtrip() {
        let commander = new_commander().await;
        let mysis = commander
            .create_mysis("Scout", "ollama", "llama3", "you are a pilot")
            .await
            .unwrap();
        let listed = commander.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), mysis.id());
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let commander = new_commander().await;
        commander.create_mysis("Scout", "ollama", "llama3", "sys").await.unwrap();
        let err = commander.create_mysis("Scout", "ollama", "llama3", "sys").await;
        assert!(matches!(err, Err(SwarmError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn at_capacity_rejects_further_creates() {
        let commander = new_commander().await;
        for i in 0..4 {
            commander
                .create_mysis(&format!("p{i}"), "ollama", "llama3", "sys")
                .await
                .unwrap();
        }
        let err = commander.create_mysis("one-too-many", "ollama", "llama3", "sys").await;
        assert!(matches!(err, Err(SwarmError::AtCapacity(4))));
    }

    #[tokio::test]
    async fn broadcast_never_reaches_its_own_sender() {
        let commander = new_commander().await;
        let sender = commander.create_mysis("Sender", "ollama", "llama3", "sys").await.unwrap();
        let other = commander.create_mysis("Other", "ollama", "llama3", "sys").await.unwrap();
        commander.broadcast(sender.id(), "found ore").await.unwrap();
        let sender_memories = commander
            .store
            .get_recent_memories(sender.id(), 10)
            .await
            .unwrap();
        assert!(sender_memories.iter().all(|m| m.content != "found ore"));
        let other_memories = commander.store.get_recent_memories(other.id(), 10).await.unwrap();
        assert!(other_memories.iter().any(|m| m.content == "found ore"));
        other.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_settles_every_pilot_to_stopped() {
        let commander = new_commander().await;
        for i in 0..3 {
            let mysis = commander
                .create_mysis(&format!("p{i}"), "ollama", "llama3", "sys")
                .await
                .unwrap();
            mysis.start().await.unwrap();
        }
        commander.stop_all().await.unwrap();
        for mysis in commander.list().await {
            assert_eq!(mysis.state(), MysisState::Stopped);
        }
    }

    struct BriefDelayProvider {
        delay: Duration,
    }
    #[async_trait]
    impl zoea_provider::Provider for BriefDelayProvider {
        fn name(&self) -> &str {
            "brief-delay"
        }
        async fn chat(&self, _m: &[zoea_provider::Message], _c: &CancellationToken) -> Result<String, zoea_provider::ProviderError> {
            Ok(String::new())
        }
        async fn chat_with_tools(
            &self,
            _messages: &[zoea_provider::Message],
            _tools: &[zoea_provider::ToolSchema],
            cancel: &CancellationToken,
        ) -> Result<zoea_provider::ChatResult, zoea_provider::ProviderError> {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(zoea_provider::ChatResult { text: Some("ok".into()), tool_calls: vec![] }),
                _ = cancel.cancelled() => Err(zoea_provider::ProviderError::Canceled),
            }
        }
        async fn stream(
            &self,
            _m: &[zoea_provider::Message],
            _c: &CancellationToken,
        ) -> Result<zoea_provider::ResponseStream, zoea_provider::ProviderError> {
            unimplemented!()
        }
        async fn close(&self) {}
    }

    /// A pilot stuck mid-turn must not stop `stop_all` from even
    /// attempting `.stop()` on every other pilot.
    #[tokio::test]
    async fn stop_all_attempts_every_pilot_even_when_one_is_slow() {
        let commander = new_commander().await;
        let mut pilots = Vec::new();
        for i in 0..3 {
            let mysis = commander
                .create_mysis(&format!("p{i}"), "ollama", "llama3", "sys")
                .await
                .unwrap();
            if i == 0 {
                mysis
                    .configure(Arc::new(BriefDelayProvider { delay: Duration::from_millis(500) }), "ollama", "llama3", 0.2)
                    .await
                    .unwrap();
            }
            mysis.start().await.unwrap();
            pilots.push(mysis);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = tokio::time::timeout(Duration::from_secs(9), commander.stop_all()).await;
        assert!(result.is_ok(), "stop_all must not wait anywhere near its 10s deadline here");
        result.unwrap().unwrap();
        for mysis in &pilots {
            assert_eq!(mysis.state(), MysisState::Stopped);
        }
    }

    #[test]
    fn auth_style_follows_provider_kind() {
        assert_ne!(AuthStyle::Bearer, AuthStyle::None);
    }
}
