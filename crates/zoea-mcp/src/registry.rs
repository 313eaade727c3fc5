// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::McpError;
use crate::tool::{Tool, ToolResult};

/// Local tool registry: name → implementation. Built once at startup and
/// shared read-only by every pilot's turn executor.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn schemas(&self) -> Vec<(String, String, Value)> {
        self.tools
            .values()
            .map(|t| (t.name().to_string(), t.description().to_string(), t.parameters_schema()))
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        mysis_id: &str,
        args: Value,
    ) -> Result<ToolResult, McpError> {
        let tool = self
            .get(name)
            .ok_or_else(|| McpError::UnknownTool(name.to_string()))?;
        tool.execute(mysis_id, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _mysis_id: &str, args: Value) -> Result<ToolResult, McpError> {
            Ok(ToolResult::ok(args.to_string()))
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        assert!(registry.contains("echo"));
        let result = registry
            .execute("echo", "m1", serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(result.content, "{\"a\":1}");
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.execute("nope", "m1", Value::Null).await,
            Err(McpError::UnknownTool(_))
        ));
    }
}
