// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};

/// Persisted lifecycle state of a pilot. See `zoea_swarm::Mysis` for the
/// in-memory state machine this mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MysisState {
    Idle,
    Running,
    Stopped,
    Errored,
}

impl MysisState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MysisState::Idle => "idle",
            MysisState::Running => "running",
            MysisState::Stopped => "stopped",
            MysisState::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => MysisState::Running,
            "stopped" => MysisState::Stopped,
            "errored" => MysisState::Errored,
            _ => MysisState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Direct,
    Broadcast,
    System,
    Llm,
    Tool,
    Nudge,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Direct => "direct",
            Source::Broadcast => "broadcast",
            Source::System => "system",
            Source::Llm => "llm",
            Source::Tool => "tool",
            Source::Nudge => "nudge",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "broadcast" => Source::Broadcast,
            "system" => Source::System,
            "llm" => Source::Llm,
            "tool" => Source::Tool,
            "nudge" => Source::Nudge,
            _ => Source::Direct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mysis {
    pub id: String,
    pub name: String,
    pub provider_key: String,
    pub model: String,
    pub temperature: f32,
    pub state: MysisState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Memory {
    pub id: i64,
    pub mysis_id: String,
    pub role: Role,
    pub source: Source,
    pub content: String,
    pub sender_id: Option<String>,
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub in_use: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}
