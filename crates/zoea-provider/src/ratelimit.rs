// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-config-key rate limiter sharing. A factory builds one `Provider` per
//! `(config_key, temperature)` pair but shares a single token-bucket budget
//! across all providers built for the same config key, so e.g. three pilots
//! on the same remote model share one request budget (spec.md §4.3).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use governor::{clock::DefaultClock, state::InMemoryState, Quota, RateLimiter};

use crate::openai_compat::{AuthStyle, OpenAICompatProvider};
use crate::provider::Provider;

pub type Limiter = RateLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>;

#[derive(Default)]
pub struct ProviderFactory {
    limiters: Mutex<HashMap<String, Arc<Limiter>>>,
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn limiter_for(&self, config_key: &str, rate_limit: u32, rate_burst: u32) -> Arc<Limiter> {
        let mut limiters = self.limiters.lock().expect("rate limiter map poisoned");
        limiters
            .entry(config_key.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_minute(NonZeroU32::new(rate_limit.max(1)).unwrap())
                    .allow_burst(NonZeroU32::new(rate_burst.max(1)).unwrap());
                Arc::new(RateLimiter::direct(quota))
            })
            .clone()
    }

    /// Build an OpenAI-compatible provider for `config_key`, sharing its
    /// rate limiter with any other provider built for the same key.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        config_key: &str,
        chat_url: String,
        api_key: Option<String>,
        model: String,
        temperature: f32,
        rate_limit: u32,
        rate_burst: u32,
        auth_style: AuthStyle,
    ) -> Arc<dyn Provider> {
        let limiter = self.limiter_for(config_key, rate_limit, rate_burst);
        Arc::new(OpenAICompatProvider::new(
            config_key.to_string(),
            model,
            api_key,
            chat_url,
            temperature,
            auth_style,
            limiter,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_config_key_shares_one_limiter() {
        let factory = ProviderFactory::new();
        let a = factory.limiter_for("ollama", 60, 5);
        let b = factory.limiter_for("ollama", 60, 5);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_config_keys_get_different_limiters() {
        let factory = ProviderFactory::new();
        let a = factory.limiter_for("ollama", 60, 5);
        let b = factory.limiter_for("opencode_zen", 60, 5);
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
