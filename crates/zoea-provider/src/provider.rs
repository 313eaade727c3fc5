// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::types::{Message, ResponseEvent, ToolCall, ToolSchema};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<ResponseEvent, ProviderError>> + Send>>;

/// Result of a tool-enabled chat call: assistant text (if any) and any
/// tool calls the model requested.
#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

/// Abstract LLM client (spec.md §4.3). Implementations wrap an HTTP client
/// and a shared rate limiter; `cancel` must be honored promptly by
/// aborting the in-flight HTTP request.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
    ) -> Result<ChatResult, ProviderError>;

    async fn stream(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<ResponseStream, ProviderError>;

    /// Close idle connections. Safe to call more than once.
    async fn close(&self);
}
