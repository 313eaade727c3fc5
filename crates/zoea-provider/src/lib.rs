// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Abstract LLM client: rate-limited `chat` / `chat_with_tools` / `stream`,
//! plus the shared request-payload assembly rules every OpenAI-compatible
//! driver needs (spec.md §4.3).

mod error;
mod openai_compat;
mod provider;
mod ratelimit;
mod request;
mod types;

pub use error::ProviderError;
pub use openai_compat::{AuthStyle, OpenAICompatProvider};
pub use provider::{ChatResult, Provider, ResponseStream};
pub use ratelimit::ProviderFactory;
pub use request::assemble_request;
pub use types::{Message, ResponseEvent, Role, ToolCall, ToolSchema};
