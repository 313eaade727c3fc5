// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde::Deserialize;

/// Credential names mapped to API keys, loaded from `credentials.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(flatten)]
    keys: BTreeMap<String, String>,
}

impl Credentials {
    /// Look up an API key by its config name, falling back to the legacy
    /// `opencode_zen` name for backward compatibility (spec.md §6).
    pub fn get_api_key(&self, config_name: &str) -> Option<&str> {
        self.keys
            .get(config_name)
            .or_else(|| self.keys.get("opencode_zen"))
            .map(String::as_str)
    }

    /// Plain lookup with no fallback, used by tests and diagnostics.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.keys.get(name).map(String::as_str)
    }
}
