// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_max_myses() -> usize {
    16
}

fn default_temperature() -> f32 {
    0.2
}

fn default_rate_limit() -> u32 {
    60
}

fn default_rate_burst() -> u32 {
    5
}

fn default_max_tool_iterations() -> usize {
    8
}

fn default_idle_nudge_seconds() -> u64 {
    30
}

fn default_llm_request_timeout_seconds() -> u64 {
    60
}

fn default_max_context_messages() -> usize {
    60
}

/// Top-level configuration, deserialized from a merged TOML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
}

/// `[providers.<name>]` table. `<name>` is the provider's config key,
/// shared between all pilots that use it (and its rate limiter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,
}

impl ProviderConfig {
    /// Infer the wire dialect from the endpoint URL, per spec.md §6:
    /// `localhost:11434` or `/ollama` → Ollama; `opencode.ai` → OpenAI-compatible.
    /// Anything else also speaks the OpenAI-compatible dialect, which is the
    /// de facto standard for self-hosted and third-party gateways alike.
    pub fn kind(&self) -> ProviderKind {
        if self.endpoint.contains("localhost:11434") || self.endpoint.contains("/ollama") {
            ProviderKind::Ollama
        } else {
            ProviderKind::OpenAiCompatible
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    OpenAiCompatible,
}

/// `[mcp]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Upstream MCP server base URL. `None` forces offline/stub mode.
    pub upstream: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            enabled: true,
        }
    }
}

/// `[swarm]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_max_myses")]
    pub max_myses: usize,
    /// Upper bound on provider/tool round-trips within a single turn.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
    /// How long a running pilot can go with no activity before the
    /// run-loop ticker wakes it with a synthetic nudge.
    #[serde(default = "default_idle_nudge_seconds")]
    pub idle_nudge_seconds: u64,
    /// Per-turn deadline for the provider call.
    #[serde(default = "default_llm_request_timeout_seconds")]
    pub llm_request_timeout_seconds: u64,
    /// Maximum number of messages composed into a single provider request.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_myses: default_max_myses(),
            max_tool_iterations: default_max_tool_iterations(),
            idle_nudge_seconds: default_idle_nudge_seconds(),
            llm_request_timeout_seconds: default_llm_request_timeout_seconds(),
            max_context_messages: default_max_context_messages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ollama_kind_from_localhost() {
        let p = ProviderConfig {
            endpoint: "http://localhost:11434/v1".into(),
            model: "llama3".into(),
            temperature: 0.2,
            rate_limit: 60,
            rate_burst: 5,
        };
        assert_eq!(p.kind(), ProviderKind::Ollama);
    }

    #[test]
    fn openai_compatible_kind_default() {
        let p = ProviderConfig {
            endpoint: "https://opencode.ai/zen/v1".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            rate_limit: 60,
            rate_burst: 5,
        };
        assert_eq!(p.kind(), ProviderKind::OpenAiCompatible);
    }

    #[test]
    fn default_swarm_config_has_positive_max_myses() {
        assert!(SwarmConfig::default().max_myses > 0);
    }
}
