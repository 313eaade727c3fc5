// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use zoea_events::EventBus;
use zoea_mcp::{build_local_registry, McpProxy, OfflineBackend, SwarmControl, UpstreamClient};
use zoea_store::Store;
use zoea_swarm::Commander;

/// Per-subscriber buffer size for the event bus (spec.md §4.2: "fixed
/// buffer size"; no specific number is named, so a generous default is
/// used — a slow UI subscriber drops its own oldest events, not the bus).
const EVENT_BUS_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug);

    if let Some(Commands::Completions { shell }) = cli.command {
        cli::print_completions(shell);
        return Ok(());
    }

    let config = Arc::new(zoea_config::load(cli.config.as_deref()).context("loading config")?);
    let credentials = Arc::new(
        zoea_config::load_credentials(cli.credentials.as_deref())
            .context("loading credentials")?,
    );

    let db_path = db_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    info!(path = %db_path.display(), "opening store");
    let store = Arc::new(Store::open(&db_path).await.context("opening store")?);

    let events = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));

    // `McpProxy`'s local tool registry needs a handle to the Commander (to
    // route zoea_send_message/zoea_broadcast/zoea_list_pilots), but the
    // Commander itself needs an `Arc<McpProxy>` to hand to every pilot it
    // creates. Rather than let Commander and McpProxy hold an actual Arc
    // cycle on each other, the registry is built against this small
    // deferred handle instead: it is its own allocation, filled in once the
    // Commander exists, and never referenced back by Commander itself.
    let swarm_handle = Arc::new(DeferredSwarmControl::default());

    let registry = build_local_registry(
        store.clone(),
        swarm_handle.clone() as Arc<dyn SwarmControl>,
    );

    let upstream: Option<Arc<dyn zoea_mcp::UpstreamTransport>> = if cli.offline {
        info!("running with the offline stub backend (--offline)");
        Some(Arc::new(OfflineBackend))
    } else {
        match &config.mcp.upstream {
            Some(url) if config.mcp.enabled => {
                info!(url = %url, "using upstream MCP server");
                Some(Arc::new(UpstreamClient::new(url.clone())))
            }
            _ => {
                info!("no upstream MCP server configured; falling back to the offline stub");
                Some(Arc::new(OfflineBackend))
            }
        }
    };

    let mcp = Arc::new(McpProxy::new(registry, upstream, store.clone()));
    mcp.initialize().await.context("initializing MCP proxy")?;

    let commander = Commander::new(store, events, mcp, config, credentials);
    swarm_handle
        .commander
        .set(commander.clone())
        .unwrap_or_else(|_| panic!("commander already set"));

    commander.load_myses().await.context("loading pilots")?;

    if cli.start_swarm {
        for mysis in commander.list().await {
            if matches!(
                mysis.state(),
                zoea_store::MysisState::Idle | zoea_store::MysisState::Errored
            ) {
                if let Err(e) = mysis.start().await {
                    warn!(mysis = %mysis.id(), error = %e, "failed to start pilot at boot");
                }
            }
        }
    }

    info!("zoea-nova is running; press Ctrl-C to stop");
    wait_for_shutdown_signal().await;

    info!("shutting down");
    commander.stop_all().await.context("stopping swarm")?;
    Ok(())
}

/// A `SwarmControl` implementor that exists purely to break the
/// Commander/McpProxy construction-order cycle: the local tool registry is
/// built against this handle before the Commander is constructed, and the
/// real Commander is slotted in immediately afterward.
#[derive(Default)]
struct DeferredSwarmControl {
    commander: OnceCell<Arc<Commander>>,
}

impl DeferredSwarmControl {
    fn commander(&self) -> &Arc<Commander> {
        self.commander
            .get()
            .expect("DeferredSwarmControl used before the commander was set")
    }
}

#[async_trait]
impl SwarmControl for DeferredSwarmControl {
    async fn send_message(&self, to: &str, content: &str) -> anyhow::Result<()> {
        SwarmControl::send_message(self.commander().as_ref(), to, content).await
    }

    async fn broadcast(&self, from: &str, content: &str) -> anyhow::Result<()> {
        SwarmControl::broadcast(self.commander().as_ref(), from, content).await
    }

    async fn list_pilots(&self) -> anyhow::Result<Vec<(String, String, String)>> {
        SwarmControl::list_pilots(self.commander().as_ref()).await
    }
}

/// `~/.local/share/zoea/zoea.db` (XDG data dir).
fn db_path() -> anyhow::Result<std::path::PathBuf> {
    let base = dirs::data_dir().context("could not determine the platform data directory")?;
    Ok(base.join("zoea").join("zoea.db"))
}

/// Waits for SIGINT, or SIGTERM on Unix.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
