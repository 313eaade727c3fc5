// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! A single pilot's state machine and run-loop (spec.md §4.2, §4.5, §4.6).
//!
//! One `Mysis` owns one long-lived `tokio::task`, the run-loop, spawned by
//! `start()` and torn down by `stop()`. The run-loop itself never blocks on
//! a turn in a separate task: per spec, tool/provider round-trips execute
//! synchronously inside the run-loop while holding `turn_mu`, so there is
//! never more than one turn in flight for a given pilot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use zoea_events::{Event, EventBus, EventKind};
use zoea_mcp::McpProxy;
use zoea_provider::{Provider, ProviderError, ToolSchema};
use zoea_store::{MysisState, Role, Source, Store};

use crate::error::SwarmError;
use crate::waitgroup::{WaitGroup, WaitGroupGuard};

/// How many consecutive zero-tool-call turns, all begun from a synthetic
/// nudge, before a running pilot is parked back to idle (spec.md §4.6,
/// SPEC_FULL.md §9(a)).
const NUDGE_CIRCUIT_BREAKER: u32 = 3;

/// Bound on how long `start()` waits for a stale turn from a superseded
/// generation to release `turn_mu` before spawning the new run-loop
/// anyway. Correctness does not depend on this succeeding — the
/// generation counter makes a late straggler's error report a no-op
/// (SPEC_FULL.md §9(b)) — it only reduces the odds of the straggler and
/// the fresh run overlapping in the logs.
const RELAUNCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on how long `stop()` waits for an in-progress turn to finish
/// before declaring the pilot stopped regardless.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct RunState {
    state: MysisState,
    generation: u64,
    cancel: Option<CancellationToken>,
    current_account: Option<String>,
    last_error: Option<String>,
    has_run_loop: bool,
}

/// One autonomous pilot: identity, durable memory (via `Store`), an LLM
/// driver, and the nudge/turn-loop machinery that drives it forward.
pub struct Mysis {
    id: String,
    name: String,
    store: Arc<Store>,
    events: Arc<EventBus>,
    mcp: Arc<McpProxy>,
    provider: RwLock<Arc<dyn Provider>>,
    run: StdMutex<RunState>,
    turn_mu: Arc<AsyncMutex<()>>,
    nudge_tx: StdMutex<Option<mpsc::Sender<()>>>,
    nudge_count: AtomicU32,
    waitgroup: WaitGroup,
    max_tool_iterations: usize,
    idle_nudge_interval: Duration,
    llm_request_timeout: Duration,
    max_context_messages: usize,
}

impl Mysis {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        initial_state: MysisState,
        store: Arc<Store>,
        events: Arc<EventBus>,
        mcp: Arc<McpProxy>,
        provider: Arc<dyn Provider>,
        waitgroup: WaitGroup,
        max_tool_iterations: usize,
        idle_nudge_interval: Duration,
        llm_request_timeout: Duration,
        max_context_messages: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            name: name.into(),
            store,
            events,
            mcp,
            provider: RwLock::new(provider),
            run: StdMutex::new(RunState {
                state: initial_state,
                generation: 0,
                cancel: None,
                current_account: None,
                last_error: None,
                has_run_loop: false,
            }),
            turn_mu: Arc::new(AsyncMutex::new(())),
            nudge_tx: StdMutex::new(None),
            nudge_count: AtomicU32::new(0),
            waitgroup,
            max_tool_iterations,
            idle_nudge_interval,
            llm_request_timeout,
            max_context_messages,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MysisState {
        self.run.lock().expect("mysis run mutex poisoned").state
    }

    pub fn has_run_loop(&self) -> bool {
        self.run.lock().expect("mysis run mutex poisoned").has_run_loop
    }

    pub fn last_error(&self) -> Option<String> {
        self.run.lock().expect("mysis run mutex poisoned").last_error.clone()
    }

    /// Wake the run-loop, if one is live, to consider taking a turn. A
    /// no-op when the pilot has no live run-loop — the triggering memory
    /// still lands in the Store and will be seen the next time it starts.
    pub fn notify(&self) {
        if let Some(tx) = self.nudge_tx.lock().expect("nudge_tx mutex poisoned").as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Swap the provider and persisted model/temperature, effective on the
    /// next turn. Does not require stopping the pilot.
    pub async fn configure(&self, provider: Arc<dyn Provider>, provider_key: &str, model: &str, temperature: f32) -> Result<(), SwarmError> {
        self.store
            .update_mysis_config(&self.id, provider_key, model, temperature)
            .await?;
        *self.provider.write().await = provider;
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), SwarmError> {
        {
            let run = self.run.lock().expect("mysis run mutex poisoned");
            if run.has_run_loop {
                return Err(SwarmError::AlreadyRunning(self.id.clone()));
            }
        }

        if tokio::time::timeout(RELAUNCH_DRAIN_TIMEOUT, self.turn_mu.lock())
            .await
            .is_err()
        {
            warn!(mysis = %self.id, "relaunch proceeding before stale turn drained");
        }

        let (generation, cancel, nudge_rx) = {
            let mut run = self.run.lock().expect("mysis run mutex poisoned");
            run.generation += 1;
            let generation = run.generation;
            let cancel = CancellationToken::new();
            run.cancel = Some(cancel.clone());
            run.has_run_loop = true;
            run.last_error = None;
            run.state = MysisState::Running;
            let (tx, rx) = mpsc::channel(1);
            *self.nudge_tx.lock().expect("nudge_tx mutex poisoned") = Some(tx.clone());
            let _ = tx.try_send(()); // give a freshly-started pilot a first look immediately
            (generation, cancel, rx)
        };
        self.nudge_count.store(0, Ordering::SeqCst);

        self.store.update_mysis_state(&self.id, MysisState::Running).await?;
        self.events.publish(Event::new(
            EventKind::StateChanged,
            Some(self.id.clone()),
            json!({"state": "running"}),
        ));

        // Registered synchronously, before the task is even spawned, so
        // `Commander::stop_all`'s waitgroup wait can never observe a zero
        // count for a pilot that is in fact about to start running.
        let wg_guard = WaitGroupGuard::new(self.waitgroup.clone());

        let this = self.clone();
        tokio::spawn(async move { this.run_loop(generation, cancel, nudge_rx, wg_guard).await });

        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<(), SwarmError> {
        let cancel = {
            let mut run = self.run.lock().expect("mysis run mutex poisoned");
            if !run.has_run_loop {
                return Ok(());
            }
            run.cancel.take()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        *self.nudge_tx.lock().expect("nudge_tx mutex poisoned") = None;

        if tokio::time::timeout(STOP_DRAIN_TIMEOUT, self.turn_mu.lock())
            .await
            .is_err()
        {
            warn!(mysis = %self.id, "stop timed out waiting for in-progress turn");
        }

        self.provider.read().await.close().await;

        let account = {
            let mut run = self.run.lock().expect("mysis run mutex poisoned");
            run.state = MysisState::Stopped;
            run.has_run_loop = false;
            run.current_account.take()
        };
        if let Some(username) = account {
            self.store.release_account(&username).await?;
        }
        self.store.update_mysis_state(&self.id, MysisState::Stopped).await?;
        self.events.publish(Event::new(
            EventKind::StateChanged,
            Some(self.id.clone()),
            json!({"state": "stopped"}),
        ));
        Ok(())
    }

    async fn run_loop(
        self: Arc<Self>,
        generation: u64,
        cancel: CancellationToken,
        mut nudge_rx: mpsc::Receiver<()>,
        _wg_guard: WaitGroupGuard,
    ) {
        let mut ticker = tokio::time::interval(self.idle_nudge_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(mysis = %self.id, generation, "run-loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if self.turn_mu.try_lock().is_ok() {
                        if let Some(tx) = self.nudge_tx.lock().expect("nudge_tx mutex poisoned").as_ref() {
                            let _ = tx.try_send(());
                        }
                    }
                }
                received = nudge_rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                    match self.turn_mu.clone().try_lock_owned() {
                        Ok(guard) => self.execute_turn(generation, &cancel, guard).await,
                        Err(_) => debug!(mysis = %self.id, "turn already in progress, dropping nudge"),
                    }
                }
            }
        }
    }

    async fn execute_turn(
        self: &Arc<Self>,
        generation: u64,
        cancel: &CancellationToken,
        _turn_guard: tokio::sync::OwnedMutexGuard<()>,
    ) {
        self.events.publish(Event::new(
            EventKind::TurnStarted,
            Some(self.id.clone()),
            json!({}),
        ));
        self.events.publish(Event::new(
            EventKind::NetworkBusy,
            Some(self.id.clone()),
            json!({}),
        ));

        if let Err(e) = self.run_turn_body(generation, cancel).await {
            self.set_error(generation, e.to_string()).await;
        }

        self.events.publish(Event::new(
            EventKind::NetworkIdle,
            Some(self.id.clone()),
            json!({}),
        ));
        self.events.publish(Event::new(
            EventKind::TurnCompleted,
            Some(self.id.clone()),
            json!({}),
        ));
    }

    async fn run_turn_body(
        self: &Arc<Self>,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<(), SwarmError> {
        let window = (self.max_context_messages * 2) as i64;
        let seed = self.store.get_recent_memories(&self.id, window).await?;
        let began_from_nudge = !seed.iter().any(|m| m.role == Role::User);

        let system = self
            .store
            .get_system_memory(&self.id)
            .await?
            .map(|m| m.content)
            .unwrap_or_default();
        let broadcasts: Vec<String> = self
            .store
            .get_recent_broadcasts(&self.id, 10)
            .await?
            .into_iter()
            .map(|m| m.content)
            .collect();
        let rendered_system = zoea_context::render_system_prompt(&system, &broadcasts);
        let nudge_count = self.nudge_count.load(Ordering::SeqCst);
        let tools = self.tool_schemas().await;

        let mut iteration = 0usize;
        loop {
            let memories = self.store.get_recent_memories(&self.id, window).await?;
            let messages = zoea_context::compose(
                &memories,
                &rendered_system,
                nudge_count,
                self.max_context_messages,
            );

            let provider = self.provider.read().await.clone();
            let outcome = tokio::time::timeout(
                self.llm_request_timeout,
                provider.chat_with_tools(&messages, &tools, cancel),
            )
            .await;

            let chat_result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(ProviderError::Canceled)) => return Ok(()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    return Err(ProviderError::Transient("request timed out".into()).into());
                }
            };

            if chat_result.tool_calls.is_empty() {
                let text = chat_result.text.unwrap_or_default();
                self.store
                    .add_memory(&self.id, Role::Assistant, Source::Llm, &text, None, None)
                    .await?;
                if began_from_nudge {
                    let count = self.nudge_count.fetch_add(1, Ordering::SeqCst) + 1;
                    if count >= NUDGE_CIRCUIT_BREAKER {
                        self.nudge_count.store(0, Ordering::SeqCst);
                        self.maybe_trip_breaker(generation).await?;
                    }
                } else {
                    self.nudge_count.store(0, Ordering::SeqCst);
                }
                return Ok(());
            }

            let envelope = zoea_context::ToolCallEnvelope::encode(&chat_result.tool_calls);
            self.store
                .add_memory(&self.id, Role::Assistant, Source::Llm, &envelope, None, None)
                .await?;
            self.nudge_count.store(0, Ordering::SeqCst);

            for call in &chat_result.tool_calls {
                self.events.publish(Event::new(
                    EventKind::ToolCalled,
                    Some(self.id.clone()),
                    json!({"name": call.name}),
                ));
                let result = self
                    .mcp
                    .call_tool(&self.id, &call.name, call.arguments.clone())
                    .await?;
                self.events.publish(Event::new(
                    EventKind::ToolResult,
                    Some(self.id.clone()),
                    json!({"name": call.name, "is_error": result.is_error}),
                ));
                self.track_auth_tool(&call.name, &call.arguments, result.is_error);
                self.store
                    .add_memory(
                        &self.id,
                        Role::Tool,
                        Source::Tool,
                        &result.content,
                        None,
                        Some(&call.id),
                    )
                    .await?;
            }

            iteration += 1;
            if iteration >= self.max_tool_iterations {
                warn!(mysis = %self.id, iteration, "max tool iterations reached, ending turn");
                return Ok(());
            }
        }
    }

    /// Track which account this pilot is currently logged in as, so
    /// `stop()`/`set_error()` can release it. The proxy itself only
    /// updates the Store's `in_use` flag (spec.md §4.4); it has no notion
    /// of "this pilot's account".
    fn track_auth_tool(&self, tool_name: &str, args: &serde_json::Value, is_error: bool) {
        if is_error {
            return;
        }
        let username = args.get("username").and_then(serde_json::Value::as_str);
        let mut run = self.run.lock().expect("mysis run mutex poisoned");
        match (tool_name, username) {
            ("login", Some(u)) | ("register", Some(u)) => run.current_account = Some(u.to_string()),
            ("logout", Some(_)) => run.current_account = None,
            _ => {}
        }
    }

    async fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.mcp
            .list_tools()
            .await
            .into_iter()
            .map(|(name, description, parameters)| ToolSchema {
                name,
                description,
                parameters,
            })
            .collect()
    }

    async fn maybe_trip_breaker(self: &Arc<Self>, generation: u64) -> Result<(), SwarmError> {
        let should = {
            let mut run = self.run.lock().expect("mysis run mutex poisoned");
            if run.generation == generation && run.state == MysisState::Running {
                run.state = MysisState::Idle;
                true
            } else {
                false
            }
        };
        if should {
            self.store.update_mysis_state(&self.id, MysisState::Idle).await?;
            self.events.publish(Event::new(
                EventKind::StateChanged,
                Some(self.id.clone()),
                json!({"state": "idle"}),
            ));
        }
        Ok(())
    }

    async fn set_error(self: &Arc<Self>, generation: u64, message: String) {
        let account = {
            let mut run = self.run.lock().expect("mysis run mutex poisoned");
            if run.generation != generation {
                return;
            }
            run.state = MysisState::Errored;
            run.last_error = Some(message.clone());
            run.has_run_loop = false;
            run.current_account.take()
        };
        *self.nudge_tx.lock().expect("nudge_tx mutex poisoned") = None;

        if let Err(e) = self.store.update_mysis_state(&self.id, MysisState::Errored).await {
            warn!(mysis = %self.id, error = %e, "failed to persist errored state");
        }
        if let Some(username) = account {
            if let Err(e) = self.store.release_account(&username).await {
                warn!(mysis = %self.id, account = %username, error = %e, "failed to release account after error");
            }
        }
        self.events.publish(Event::new(
            EventKind::Error,
            Some(self.id.clone()),
            json!({"message": message}),
        ));
        self.events.publish(Event::new(
            EventKind::StateChanged,
            Some(self.id.clone()),
            json!({"state": "errored"}),
        ));
    }
}
