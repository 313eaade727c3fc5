// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mysis {0} not found")]
    MysisNotFound(String),
    #[error("no accounts available")]
    NoAccountsAvailable,
    #[error("schema version mismatch: found {found}, expected {expected} (reset the database: delete the data file and restart)")]
    SchemaVersionMismatch { found: i64, expected: i64 },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
