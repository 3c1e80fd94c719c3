//! SQLite-backed history store
//!
//! One connection behind a mutex. Every public operation takes the lock for
//! its whole duration, and multi-statement writes run in an immediate
//! transaction, so "find or create the active conversation" and "append a
//! message" can never interleave into two divergent active conversations.
//!
//! Timestamps are stored as Unix milliseconds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::types::{
    Conversation, ConversationSummary, DataRecord, Message, NewMessage, Role, ToolCallRecord,
};

const SCHEMA_VERSION: i32 = 1;
const PREVIEW_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("conversation {0} not found")]
    ConversationNotFound(String),

    #[error("corrupt history row: {0}")]
    Corrupt(String),

    #[error("history store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Pick the conversation to continue, if any
///
/// `latest` is the conversation with the most recent activity. It is reused
/// only while `now - last_activity < gap`.
pub fn select_active<'a>(
    latest: Option<&'a Conversation>,
    now: DateTime<Utc>,
    gap: Duration,
) -> Option<&'a Conversation> {
    latest.filter(|c| now.signed_duration_since(c.last_activity) < gap)
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| HistoryError::Corrupt(format!("invalid timestamp {}", ms)))
}

fn preview(content: Option<String>) -> String {
    match content {
        Some(text) if !text.trim().is_empty() => {
            let text = text.trim();
            if text.chars().count() > PREVIEW_CHARS {
                let cut: String = text.chars().take(PREVIEW_CHARS).collect();
                format!("{}…", cut)
            } else {
                text.to_string()
            }
        }
        _ => "(empty)".to_string(),
    }
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
    session_gap: Duration,
}

impl HistoryStore {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: &Path, session_gap_hours: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| HistoryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        // FULL: a write is on disk before the call returns
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;",
        )?;
        info!(path = %path.display(), "Opened history database");
        Self::from_connection(conn, session_gap_hours)
    }

    /// Throwaway store, used by tests
    pub fn in_memory(session_gap_hours: u64) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, session_gap_hours)
    }

    fn from_connection(conn: Connection, session_gap_hours: u64) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
            session_gap: Duration::hours(session_gap_hours as i64),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| HistoryError::Poisoned)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_activity
                ON conversations(last_activity DESC);

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'tool')),
                content TEXT,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, id);

            CREATE TABLE IF NOT EXISTS tool_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                tool TEXT NOT NULL,
                arguments TEXT NOT NULL,
                result TEXT NOT NULL,
                is_error INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tool_calls_message
                ON tool_calls(message_id, position);

            -- No foreign key: records outlive the conversation that produced them
            CREATE TABLE IF NOT EXISTS data_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT,
                tool TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    pub fn session_gap(&self) -> Duration {
        self.session_gap
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────────

    /// Most recent conversation if it is still active at `now`, else a new one
    pub fn get_active_conversation(&self, now: DateTime<Utc>) -> Result<Conversation> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let latest = tx
            .query_row(
                "SELECT id, created_at, last_activity FROM conversations
                 ORDER BY last_activity DESC, id DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .optional()?
            .map(|(id, created, last)| {
                Ok::<_, HistoryError>(Conversation {
                    id,
                    created_at: from_millis(created)?,
                    last_activity: from_millis(last)?,
                })
            })
            .transpose()?;

        if let Some(active) = select_active(latest.as_ref(), now, self.session_gap) {
            let active = active.clone();
            tx.commit()?;
            return Ok(active);
        }

        let conversation = Conversation {
            id: Uuid::now_v7().to_string(),
            created_at: now,
            last_activity: now,
        };
        tx.execute(
            "INSERT INTO conversations (id, created_at, last_activity) VALUES (?1, ?2, ?2)",
            params![conversation.id, to_millis(now)],
        )?;
        tx.commit()?;
        info!(conversation_id = %conversation.id, "Started new conversation");
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, created_at, last_activity FROM conversations WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .optional()?;
        row.map(|(id, created, last)| {
            Ok::<_, HistoryError>(Conversation {
                id,
                created_at: from_millis(created)?,
                last_activity: from_millis(last)?,
            })
        })
        .transpose()
    }

    /// Append a message (and its tool calls) and bump `last_activity`
    ///
    /// `last_activity` never moves backwards, even if `now` is older than
    /// the stored value.
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        // Encode outside the lock
        let encoded_calls = message
            .tool_calls
            .iter()
            .map(|c| Ok((serde_json::to_string(&c.arguments)?, serde_json::to_string(&c.result)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(HistoryError::ConversationNotFound(conversation_id.to_string()));
        }

        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, message.role.as_str(), message.content, to_millis(now)],
        )?;
        let message_id = tx.last_insert_rowid();

        for (position, (call, (arguments, result))) in
            message.tool_calls.iter().zip(&encoded_calls).enumerate()
        {
            tx.execute(
                "INSERT INTO tool_calls
                 (message_id, position, tool, arguments, result, is_error, duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message_id,
                    position as i64,
                    call.tool,
                    arguments,
                    result,
                    call.is_error,
                    call.duration_ms as i64
                ],
            )?;
        }

        tx.execute(
            "UPDATE conversations SET last_activity = MAX(last_activity, ?2) WHERE id = ?1",
            params![conversation_id, to_millis(now)],
        )?;
        tx.commit()?;

        debug!(conversation_id, message_id, role = message.role.as_str(), "Appended message");
        Ok(Message {
            id: message_id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            created_at: now,
        })
    }

    /// All messages of a conversation in append order
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;

        let mut calls: HashMap<i64, Vec<ToolCallRecord>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT t.message_id, t.tool, t.arguments, t.result, t.is_error, t.duration_ms
                 FROM tool_calls t JOIN messages m ON m.id = t.message_id
                 WHERE m.conversation_id = ?1
                 ORDER BY t.message_id, t.position",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;
            for row in rows {
                let (message_id, tool, arguments, result, is_error, duration_ms) = row?;
                calls.entry(message_id).or_default().push(ToolCallRecord {
                    tool,
                    arguments: serde_json::from_str(&arguments)?,
                    result: serde_json::from_str(&result)?,
                    is_error,
                    duration_ms: duration_ms.max(0) as u64,
                });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at FROM messages
             WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (id, role, content, created_at) = row?;
            let role = Role::parse(&role)
                .ok_or_else(|| HistoryError::Corrupt(format!("unknown role '{}'", role)))?;
            messages.push(Message {
                id,
                conversation_id: conversation_id.to_string(),
                role,
                content,
                tool_calls: calls.remove(&id).unwrap_or_default(),
                created_at: from_millis(created_at)?,
            });
        }
        Ok(messages)
    }

    /// Recent conversations, newest activity first
    pub fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.created_at, c.last_activity,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id),
                    (SELECT m.content FROM messages m
                      WHERE m.conversation_id = c.id AND m.role = 'user'
                      ORDER BY m.id LIMIT 1)
             FROM conversations c
             ORDER BY c.last_activity DESC, c.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, created, last, count, first_user) = row?;
            summaries.push(ConversationSummary {
                id,
                created_at: from_millis(created)?,
                last_activity: from_millis(last)?,
                message_count: count.max(0) as u32,
                preview: preview(first_user),
            });
        }
        Ok(summaries)
    }

    /// Remove a conversation with all its messages and tool calls
    ///
    /// Data records are left alone. Returns whether the conversation existed.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM tool_calls WHERE message_id IN
             (SELECT id FROM messages WHERE conversation_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        tx.commit()?;
        if removed > 0 {
            info!(conversation_id = id, "Deleted conversation");
        }
        Ok(removed > 0)
    }

    /// Remove every conversation; data records are untouched
    pub fn clear_all(&self) -> Result<u64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM tool_calls", [])?;
        tx.execute("DELETE FROM messages", [])?;
        let removed = tx.execute("DELETE FROM conversations", [])?;
        tx.commit()?;
        info!(removed, "Cleared conversation history");
        Ok(removed as u64)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Data records
    // ─────────────────────────────────────────────────────────────────────────

    pub fn append_data_record(
        &self,
        conversation_id: Option<&str>,
        tool: &str,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<DataRecord> {
        let encoded = serde_json::to_string(data)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO data_records (conversation_id, tool, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, tool, encoded, to_millis(now)],
        )?;
        let id = conn.last_insert_rowid();
        debug!(record_id = id, tool, "Recorded tool data");
        Ok(DataRecord {
            id,
            conversation_id: conversation_id.map(str::to_string),
            tool: tool.to_string(),
            data: data.clone(),
            created_at: now,
        })
    }

    /// Recent records, newest first
    pub fn list_data_records(&self, limit: usize) -> Result<Vec<DataRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, tool, data, created_at FROM data_records
             ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (id, conversation_id, tool, data, created_at) = row?;
            records.push(DataRecord {
                id,
                conversation_id,
                tool,
                data: serde_json::from_str(&data)?,
                created_at: from_millis(created_at)?,
            });
        }
        Ok(records)
    }

    pub fn delete_data_record(&self, id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM data_records WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    pub fn clear_data_records(&self) -> Result<u64> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM data_records", [])?;
        info!(removed, "Cleared data records");
        Ok(removed as u64)
    }
}
