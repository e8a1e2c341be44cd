use chrono::{DateTime, SecondsFormat, Utc};
use ollama_agent_core::types::{ConversationItem, Role, ToolExchange};
use ollama_agent_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const PREVIEW_CHARS: usize = 50;
const NO_MESSAGES: &str = "No messages";

/// Index entry returned by [`SessionStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: u64,
}

/// Durable, append-only conversation log backed by SQLite.
///
/// All writes go through one connection behind a mutex, so appends to a
/// session are serialized and their order fixes the persisted ordinal.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SessionStore {
    /// Open (or create) the session database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Storage(format!("Failed to open session db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to open in-memory db: {}", e)))?;
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS items (
                session_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, ordinal)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active);
            ",
        )
        .map_err(|e| Error::Storage(format!("Failed to init session schema: {}", e)))?;

        debug!(path = %self.db_path.display(), "Session store schema initialized");
        Ok(())
    }

    /// Append one item, returning its ordinal within the session.
    pub fn append(&self, session_id: &str, item: &ConversationItem) -> Result<u64> {
        let positions = self.append_turn(session_id, std::slice::from_ref(item))?;
        positions
            .into_iter()
            .next()
            .ok_or_else(|| Error::Storage("append produced no position".to_string()))
    }

    /// Append several items in one transaction: all land or none do.
    pub fn append_turn(&self, session_id: &str, items: &[ConversationItem]) -> Result<Vec<u64>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Begin transaction error: {}", e)))?;

        let now = timestamp(Utc::now());
        touch_session(&tx, session_id, &now)?;

        let mut next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(ordinal) + 1, 0) FROM items WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        let mut positions = Vec::with_capacity(items.len());
        for item in items {
            let tool_calls = if item.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&item.tool_calls)?)
            };
            tx.execute(
                "INSERT INTO items (session_id, ordinal, role, content, tool_calls, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    next,
                    item.role.as_str(),
                    item.content,
                    tool_calls,
                    timestamp(item.created_at)
                ],
            )
            .map_err(|e| Error::Storage(format!("Insert error: {}", e)))?;
            positions.push(next as u64);
            next += 1;
        }

        tx.commit()
            .map_err(|e| Error::Storage(format!("Commit error: {}", e)))?;
        debug!(session = %session_id, count = items.len(), "Appended session items");
        Ok(positions)
    }

    /// Ordered items of a session; empty if the session has none.
    pub fn load(&self, session_id: &str) -> Result<Vec<ConversationItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT ordinal, role, content, tool_calls, created_at
                 FROM items WHERE session_id = ?1 ORDER BY ordinal ASC",
            )
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;

        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok(RawItem {
                    ordinal: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    tool_calls: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        let mut items = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| Error::Storage(format!("Row error: {}", e)))?;
            items.push(raw.decode(session_id)?);
        }
        Ok(items)
    }

    /// All sessions, most recently active first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.created_at, s.last_active,
                        (SELECT COUNT(*) FROM items i WHERE i.session_id = s.id),
                        (SELECT content FROM items i
                          WHERE i.session_id = s.id AND i.role = 'user'
                          ORDER BY i.ordinal ASC LIMIT 1)
                 FROM sessions s
                 ORDER BY s.last_active DESC, s.created_at DESC",
            )
            .map_err(|e| Error::Storage(format!("Prepare error: {}", e)))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, created_at, last_active, count, first_user) =
                row.map_err(|e| Error::Storage(format!("Row error: {}", e)))?;
            out.push(SessionSummary {
                preview: first_user
                    .as_deref()
                    .map(preview_text)
                    .unwrap_or_else(|| NO_MESSAGES.to_string()),
                created_at: parse_timestamp(&created_at)?,
                last_active: parse_timestamp(&last_active)?,
                message_count: count as u64,
                id,
            });
        }
        Ok(out)
    }

    /// Remove a session and its items. Returns false if nothing existed.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Storage(format!("Begin transaction error: {}", e)))?;
        let items = tx
            .execute("DELETE FROM items WHERE session_id = ?1", params![session_id])
            .map_err(|e| Error::Storage(format!("Delete error: {}", e)))?;
        let sessions = tx
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
            .map_err(|e| Error::Storage(format!("Delete error: {}", e)))?;
        tx.commit()
            .map_err(|e| Error::Storage(format!("Commit error: {}", e)))?;

        let removed = items + sessions > 0;
        if removed {
            info!(session = %session_id, items, "Deleted session");
        }
        Ok(removed)
    }

    /// Start a fresh session and record it in the index.
    pub fn reset(&self) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let conn = self.conn()?;
        let now = timestamp(Utc::now());
        conn.execute(
            "INSERT INTO sessions (id, created_at, last_active) VALUES (?1, ?2, ?2)",
            params![id, now],
        )
        .map_err(|e| Error::Storage(format!("Insert error: {}", e)))?;
        debug!(session = %id, "Created session");
        Ok(id)
    }

    pub fn exists(&self, session_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Query error: {}", e)))?;
        Ok(found.is_some())
    }
}

struct RawItem {
    ordinal: i64,
    role: String,
    content: String,
    tool_calls: Option<String>,
    created_at: String,
}

impl RawItem {
    fn decode(self, session_id: &str) -> Result<ConversationItem> {
        let role = Role::parse(&self.role).ok_or_else(|| {
            Error::Storage(format!(
                "session {} item {}: unknown role '{}'",
                session_id, self.ordinal, self.role
            ))
        })?;
        let tool_calls: Vec<ToolExchange> = match self.tool_calls.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| {
                Error::Storage(format!(
                    "session {} item {}: undecodable tool calls: {}",
                    session_id, self.ordinal, e
                ))
            })?,
            _ => Vec::new(),
        };
        Ok(ConversationItem {
            role,
            content: self.content,
            ordinal: self.ordinal as u64,
            tool_calls,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn touch_session(tx: &Transaction<'_>, session_id: &str, now: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO sessions (id, created_at, last_active) VALUES (?1, ?2, ?2)
         ON CONFLICT(id) DO UPDATE SET last_active = excluded.last_active",
        params![session_id, now],
    )
    .map_err(|e| Error::Storage(format!("Session index error: {}", e)))?;
    Ok(())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("invalid timestamp '{}': {}", raw, e)))
}

fn preview_text(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}
