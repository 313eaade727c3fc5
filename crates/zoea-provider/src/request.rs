// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared request-payload assembly rules every OpenAI-compatible driver
//! configures with its own endpoint/auth. Factored out so both the Ollama
//! and generic OpenAI-compatible drivers apply identical message hygiene
//! (spec.md §4.3):
//!
//! - merge all `role=system` messages into a single leading system message
//! - reject two consecutive assistant messages without an intervening
//!   tool/user message
//! - if the array ends up system-only, append a synthetic `Continue.` user
//!   message (some upstream servers crash counting tokens on system-only
//!   input)
//! - always send `stream=false` for non-streaming calls

use serde_json::{json, Value};

use crate::types::{Message, Role, ToolSchema};
use crate::ProviderError;

pub fn assemble_request(
    model: &str,
    messages: &[Message],
    tools: &[ToolSchema],
    temperature: f32,
) -> Result<Value, ProviderError> {
    let messages = merge_system_messages(messages);
    validate_no_consecutive_assistant(&messages)?;
    let messages = pad_if_system_only(messages);

    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": temperature,
        "stream": false,
    });

    if !tools.is_empty() {
        let tool_defs: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tool_defs);
    }

    Ok(body)
}

fn merge_system_messages(messages: &[Message]) -> Vec<Message> {
    let mut merged_system = String::new();
    let mut rest = Vec::new();
    for m in messages {
        if m.role == Role::System {
            if !merged_system.is_empty() {
                merged_system.push('\n');
            }
            merged_system.push_str(m.content.as_deref().unwrap_or(""));
        } else {
            rest.push(m.clone());
        }
    }

    let mut out = Vec::with_capacity(rest.len() + 1);
    if !merged_system.is_empty() {
        out.push(Message::system(merged_system));
    }
    out.extend(rest);
    out
}

fn validate_no_consecutive_assistant(messages: &[Message]) -> Result<(), ProviderError> {
    for window in messages.windows(2) {
        if window[0].role == Role::Assistant && window[1].role == Role::Assistant {
            return Err(ProviderError::MalformedResponse(
                "two consecutive assistant messages with no intervening tool/user message".into(),
            ));
        }
    }
    Ok(())
}

fn pad_if_system_only(messages: Vec<Message>) -> Vec<Message> {
    if !messages.is_empty() && messages.iter().all(|m| m.role == Role::System) {
        let mut messages = messages;
        messages.push(Message::user("Continue."));
        messages
    } else {
        messages
    }
}
