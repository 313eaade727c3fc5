// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE myses (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    provider_key  TEXT NOT NULL,
    model         TEXT NOT NULL,
    temperature   REAL NOT NULL,
    state         TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE memories (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    mysis_id      TEXT NOT NULL REFERENCES myses(id) ON DELETE CASCADE,
    role          TEXT NOT NULL,
    source        TEXT NOT NULL,
    content       TEXT NOT NULL,
    sender_id     TEXT,
    tool_call_id  TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX idx_memories_mysis_id ON memories(mysis_id, id);

CREATE TABLE accounts (
    username      TEXT PRIMARY KEY,
    password      TEXT NOT NULL,
    in_use        INTEGER NOT NULL DEFAULT 0,
    last_used_at  TEXT
);

CREATE TABLE schema_version (
    version INTEGER NOT NULL
);
"#;

/// Open the database, apply startup pragmas, and verify/create the schema.
pub fn init(conn: &Connection) -> Result<(), StoreError> {
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    let version: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| {
            r.get(0)
        })
        .ok();

    match version {
        None => {
            // Either a brand new file, or schema_version table doesn't exist
            // yet. Distinguish by checking sqlite_master.
            let has_table: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
                    [],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if has_table {
                // Table exists but is empty — treat as version 0, below current.
                return Err(StoreError::SchemaVersionMismatch {
                    found: 0,
                    expected: SCHEMA_VERSION,
                });
            }
            info!("no schema found, creating fresh database");
            conn.execute_batch(SCHEMA_SQL)?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            Ok(())
        }
        Some(v) if v == SCHEMA_VERSION => {
            debug!(version = v, "schema version matches");
            Ok(())
        }
        Some(v) => Err(StoreError::SchemaVersionMismatch {
            found: v,
            expected: SCHEMA_VERSION,
        }),
    }
}
