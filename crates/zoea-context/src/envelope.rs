// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Canonical serialized form for an assistant memory's tool calls
//! (SPEC_FULL.md §3): `[{"id","name","arguments"}]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use zoea_provider::ToolCall;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEnvelope {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCallEnvelope {
    pub fn encode(calls: &[ToolCall]) -> String {
        let envelopes: Vec<ToolCallEnvelope> = calls
            .iter()
            .map(|c| ToolCallEnvelope {
                id: c.id.clone(),
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect();
        serde_json::to_string(&envelopes).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn decode(content: &str) -> Vec<ToolCall> {
        serde_json::from_str::<Vec<ToolCallEnvelope>>(content)
            .unwrap_or_default()
            .into_iter()
            .map(|e| ToolCall {
                id: e.id,
                name: e.name,
                arguments: e.arguments,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrips_tool_calls() {
        let calls = vec![ToolCall {
            id: "t1".into(),
            name: "get_status".into(),
            arguments: json!({"a": 1}),
        }];
        let encoded = ToolCallEnvelope::encode(&calls);
        let decoded = ToolCallEnvelope::decode(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, "t1");
        assert_eq!(decoded[0].name, "get_status");
    }

    #[test]
    fn decode_of_plain_text_yields_empty() {
        assert!(ToolCallEnvelope::decode("just some assistant text").is_empty());
    }
}
