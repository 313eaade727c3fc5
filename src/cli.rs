// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "zoea-nova",
    about = "Orchestrator for a swarm of autonomous AI pilots",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file (overrides the layered search path)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Path to the credentials file (overrides `~/.config/zoea/credentials.toml`)
    #[arg(long)]
    pub credentials: Option<PathBuf>,

    /// Raise the default log filter from info to debug
    #[arg(long)]
    pub debug: bool,

    /// Run without an upstream MCP server; local tools only, offline stub
    /// backend for the rest (spec.md §4.4)
    #[arg(long)]
    pub offline: bool,

    /// Start every persisted pilot in {idle, errored} immediately on boot
    #[arg(long)]
    pub start_swarm: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "zoea-nova", &mut std::io::stdout());
}
