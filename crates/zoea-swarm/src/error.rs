// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("pilot not found: {0}")]
    MysisNotFound(String),

    #[error("no [providers.{0}] configured")]
    UnknownProvider(String),

    #[error("a pilot named {0:?} already exists")]
    DuplicateName(String),

    #[error("pilot {0} is already running")]
    AlreadyRunning(String),

    #[error("swarm is at its configured capacity ({0} pilots)")]
    AtCapacity(usize),

    #[error("store error: {0}")]
    Store(#[from] zoea_store::StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] zoea_provider::ProviderError),

    #[error("tool error: {0}")]
    Mcp(#[from] zoea_mcp::McpError),
}
