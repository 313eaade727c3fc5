// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request canceled")]
    Canceled,
    #[error("rate limited, retry after budget replenishes")]
    RateLimited,
    #[error("transient transport error: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
