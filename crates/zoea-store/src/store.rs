// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::models::{Account, Memory, Mysis, MysisState, Role, Source};
use crate::schema;

/// Durable state store. Cheaply `Clone`-able; all clones share one
/// connection behind a mutex, giving the single-writer property spec.md
/// requires without needing a separate connection pool.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the SQLite database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(path)?;
            schema::init(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open_in_memory()?;
            schema::init(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("store connection mutex poisoned");
            f(&guard)
        })
        .await?
    }

    // ── Myses ────────────────────────────────────────────────────────────

    pub async fn create_mysis(
        &self,
        id: &str,
        name: &str,
        provider_key: &str,
        model: &str,
        temperature: f32,
    ) -> Result<Mysis, StoreError> {
        let (id, name, provider_key, model) = (
            id.to_string(),
            name.to_string(),
            provider_key.to_string(),
            model.to_string(),
        );
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO myses (id, name, provider_key, model, temperature, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id,
                    name,
                    provider_key,
                    model,
                    temperature,
                    MysisState::Idle.as_str(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(Mysis {
                id,
                name,
                provider_key,
                model,
                temperature,
                state: MysisState::Idle,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    pub async fn get_mysis(&self, id: &str) -> Result<Mysis, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, name, provider_key, model, temperature, state, created_at, updated_at
                 FROM myses WHERE id = ?1",
                params![id],
                row_to_mysis,
            )
            .optional()?
            .ok_or(StoreError::MysisNotFound(id))
        })
        .await
    }

    pub async fn list_myses(&self) -> Result<Vec<Mysis>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, provider_key, model, temperature, state, created_at, updated_at
                 FROM myses ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], row_to_mysis)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    pub async fn update_mysis_state(&self, id: &str, state: MysisState) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE myses SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), Utc::now().to_rfc3339(), id],
            )?;
            if n == 0 {
                return Err(StoreError::MysisNotFound(id));
            }
            Ok(())
        })
        .await
    }

    pub async fn update_mysis_config(
        &self,
        id: &str,
        provider_key: &str,
        model: &str,
        temperature: f32,
    ) -> Result<(), StoreError> {
        let (id, provider_key, model) = (id.to_string(), provider_key.to_string(), model.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE myses SET provider_key = ?1, model = ?2, temperature = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![provider_key, model, temperature, Utc::now().to_rfc3339(), id],
            )?;
            if n == 0 {
                return Err(StoreError::MysisNotFound(id));
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_mysis(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute("DELETE FROM myses WHERE id = ?1", params![id])?;
            if n == 0 {
                return Err(StoreError::MysisNotFound(id));
            }
            Ok(())
        })
        .await
    }

    pub async fn count_myses(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM myses", [], |r| r.get(0))
                .map_err(Into::into)
        })
        .await
    }

    // ── Memories ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn add_memory(
        &self,
        mysis_id: &str,
        role: Role,
        source: Source,
        content: &str,
        sender_id: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Result<Memory, StoreError> {
        let mysis_id = mysis_id.to_string();
        let content = content.to_string();
        let sender_id = sender_id.map(str::to_string);
        let tool_call_id = tool_call_id.map(str::to_string);
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO memories (mysis_id, role, source, content, sender_id, tool_call_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    mysis_id,
                    role.as_str(),
                    source.as_str(),
                    content,
                    sender_id,
                    tool_call_id,
                    now.to_rfc3339(),
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(Memory {
                id,
                mysis_id,
                role,
                source,
                content,
                sender_id,
                tool_call_id,
                created_at: now,
            })
        })
        .await
    }

    pub async fn get_recent_memories(
        &self,
        mysis_id: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let mysis_id = mysis_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, mysis_id, role, source, content, sender_id, tool_call_id, created_at
                 FROM memories WHERE mysis_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![mysis_id, limit], row_to_memory)?;
            let mut out = rows.collect::<Result<Vec<_>, _>>()?;
            out.reverse();
            Ok(out)
        })
        .await
    }

    pub async fn get_system_memory(&self, mysis_id: &str) -> Result<Option<Memory>, StoreError> {
        let mysis_id = mysis_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, mysis_id, role, source, content, sender_id, tool_call_id, created_at
                 FROM memories WHERE mysis_id = ?1 AND role = 'system' AND source = 'system'
                 ORDER BY id ASC LIMIT 1",
                params![mysis_id],
                row_to_memory,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    pub async fn search_memories(
        &self,
        mysis_id: &str,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        self.search_by_role(mysis_id, None, query, limit).await
    }

    pub async fn search_reasoning(
        &self,
        mysis_id: &str,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        self.search_by_role(mysis_id, Some(Role::Assistant), query, limit)
            .await
    }

    async fn search_by_role(
        &self,
        mysis_id: &str,
        role: Option<Role>,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let mysis_id = mysis_id.to_string();
        let pattern = format!("%{query}%");
        let role_filter = role.map(|r| r.as_str().to_string());
        self.with_conn(move |conn| {
            let rows = if let Some(role) = &role_filter {
                let mut stmt = conn.prepare(
                    "SELECT id, mysis_id, role, source, content, sender_id, tool_call_id, created_at
                     FROM memories WHERE mysis_id = ?1 AND role = ?2 AND content LIKE ?3
                     ORDER BY id DESC LIMIT ?4",
                )?;
                stmt.query_map(params![mysis_id, role, pattern, limit], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?
            } else {
                let mut stmt = conn.prepare(
                    "SELECT id, mysis_id, role, source, content, sender_id, tool_call_id, created_at
                     FROM memories WHERE mysis_id = ?1 AND content LIKE ?2
                     ORDER BY id DESC LIMIT ?3",
                )?;
                stmt.query_map(params![mysis_id, pattern, limit], row_to_memory)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            Ok(rows)
        })
        .await
    }

    pub async fn search_broadcasts(
        &self,
        mysis_id: &str,
        query: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let mysis_id = mysis_id.to_string();
        let pattern = format!("%{query}%");
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, mysis_id, role, source, content, sender_id, tool_call_id, created_at
                 FROM memories WHERE mysis_id = ?1 AND source = 'broadcast' AND content LIKE ?2
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![mysis_id, pattern, limit], row_to_memory)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    /// Unique-by-content broadcasts, newest first then re-ordered
    /// chronologically, as spec.md §4.1 requires.
    pub async fn get_recent_broadcasts(
        &self,
        mysis_id: &str,
        limit: i64,
    ) -> Result<Vec<Memory>, StoreError> {
        let mysis_id = mysis_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, mysis_id, role, source, content, sender_id, tool_call_id, created_at
                 FROM memories WHERE mysis_id = ?1 AND source = 'broadcast' ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![mysis_id], row_to_memory)?;
            let mut seen = std::collections::HashSet::new();
            let mut unique = Vec::new();
            for row in rows {
                let m = row?;
                if seen.insert(m.content.clone()) {
                    unique.push(m);
                    if unique.len() as i64 >= limit {
                        break;
                    }
                }
            }
            unique.reverse();
            Ok(unique)
        })
        .await
    }

    // ── Accounts ─────────────────────────────────────────────────────────

    pub async fn create_account(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let (username, password) = (username.to_string(), password.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO accounts (username, password, in_use, last_used_at)
                 VALUES (?1, ?2, 0, NULL)",
                params![username, password],
            )?;
            Ok(())
        })
        .await
    }

    /// Returns some account with `in_use = 0` without modifying it. The
    /// caller is responsible for calling `mark_account_in_use` only after a
    /// real upstream login succeeds (spec.md §4.1 rationale).
    pub async fn claim_account(&self) -> Result<Account, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT username, password, in_use, last_used_at FROM accounts
                 WHERE in_use = 0 LIMIT 1",
                [],
                row_to_account,
            )
            .optional()?
            .ok_or(StoreError::NoAccountsAvailable)
        })
        .await
    }

    /// Idempotent: marking an already-in-use account in-use again is a no-op
    /// beyond refreshing `last_used_at`.
    pub async fn mark_account_in_use(&self, username: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE accounts SET in_use = 1, last_used_at = ?1 WHERE username = ?2",
                params![Utc::now().to_rfc3339(), username],
            )?;
            Ok(())
        })
        .await
    }

    /// Idempotent: releasing an already-free account is a no-op.
    pub async fn release_account(&self, username: &str) -> Result<(), StoreError> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE accounts SET in_use = 0 WHERE username = ?1",
                params![username],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn release_all_accounts(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE accounts SET in_use = 0", [])?;
            Ok(())
        })
        .await
    }
}

fn row_to_mysis(row: &rusqlite::Row) -> rusqlite::Result<Mysis> {
    let state: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Mysis {
        id: row.get(0)?,
        name: row.get(1)?,
        provider_key: row.get(2)?,
        model: row.get(3)?,
        temperature: row.get(4)?,
        state: MysisState::parse(&state),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let role: String = row.get(2)?;
    let source: String = row.get(3)?;
    let created_at: String = row.get(7)?;
    Ok(Memory {
        id: row.get(0)?,
        mysis_id: row.get(1)?,
        role: Role::parse(&role),
        source: Source::parse(&source),
        content: row.get(4)?,
        sender_id: row.get(5)?,
        tool_call_id: row.get(6)?,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    let in_use: i64 = row.get(2)?;
    let last_used_at: Option<String> = row.get(3)?;
    Ok(Account {
        username: row.get(0)?,
        password: row.get(1)?,
        in_use: in_use != 0,
        last_used_at: last_used_at.as_deref().map(parse_ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
