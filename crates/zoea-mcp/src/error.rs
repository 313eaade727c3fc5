// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("retries exhausted calling {tool}")]
    ToolRetryExhausted { tool: String },
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] zoea_store::StoreError),
}
