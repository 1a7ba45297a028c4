//! Durable table store for the Relay engine.
//!
//! One WAL-journaled SQLite database holds conversation history, tool and
//! artifact logs, monitor snapshots, session locks, stream overflow
//! events, memory records, and the meta K/V. A single shared connection
//! behind a mutex keeps writes serialized; callers that sit on the async
//! runtime wrap calls in `spawn_blocking`.

mod locks;
mod memory;
mod stats;
mod stream_events;

pub use locks::LockOutcome;
pub use memory::{MemoryRecord, MemoryTaskLog};
pub use stats::{ToolUsageStat, UserStat};

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use relay_domain::chat::{ArtifactRecord, ChatRecord, ToolLogRecord};
use relay_domain::{Error, Result};

/// Seconds since the Unix epoch, as the storage timestamp type.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub(crate) fn sql_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// The storage gateway. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Storage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(sql_err)?;
        Self::from_connection(conn)
    }

    /// An in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA foreign_keys=ON;\n\
             PRAGMA busy_timeout=3000;",
        )
        .map_err(sql_err)?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Idempotent schema creation.
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_time REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT,
                reasoning_content TEXT,
                meta TEXT,
                timestamp REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_history_session
                ON chat_history (user_id, session_id, id);
            CREATE TABLE IF NOT EXISTS tool_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                tool TEXT NOT NULL,
                ok INTEGER NOT NULL,
                error TEXT,
                args TEXT,
                data TEXT,
                sandbox INTEGER,
                timestamp REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS artifact_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                action TEXT NOT NULL,
                name TEXT NOT NULL,
                ok INTEGER NOT NULL,
                error TEXT,
                meta TEXT,
                tool TEXT NOT NULL,
                timestamp REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_artifact_logs_session
                ON artifact_logs (user_id, session_id, id);
            CREATE TABLE IF NOT EXISTS monitor_sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_time REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS system_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                level TEXT NOT NULL,
                logger TEXT NOT NULL,
                message TEXT NOT NULL,
                payload TEXT
            );
            CREATE TABLE IF NOT EXISTS session_locks (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                created_time REAL NOT NULL,
                updated_time REAL NOT NULL,
                expires_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS stream_events (
                session_id TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_time REAL NOT NULL,
                PRIMARY KEY (session_id, event_id)
            );
            CREATE TABLE IF NOT EXISTS memory_settings (
                user_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                updated_time REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS memory_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                summary TEXT NOT NULL,
                created_time REAL NOT NULL,
                updated_time REAL NOT NULL,
                UNIQUE (user_id, session_id)
            );
            CREATE TABLE IF NOT EXISTS memory_task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                queued_time REAL NOT NULL,
                started_time REAL NOT NULL,
                finished_time REAL NOT NULL,
                elapsed_s REAL NOT NULL,
                request_payload TEXT,
                result TEXT,
                error TEXT,
                updated_time REAL NOT NULL,
                UNIQUE (user_id, session_id)
            );",
        )
        .map_err(sql_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Meta K/V
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value, updated_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value,
                                            updated_time = excluded.updated_time",
            params![key, value, now_ts()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT value FROM meta WHERE key = ?1")
            .map_err(sql_err)?;
        let mut rows = stmt.query(params![key]).map_err(sql_err)?;
        match rows.next().map_err(sql_err)? {
            Some(row) => Ok(Some(row.get(0).map_err(sql_err)?)),
            None => Ok(None),
        }
    }

    /// Atomic increment-or-create for numeric meta values. Returns the
    /// value after the increment.
    pub fn incr_meta(&self, key: &str, delta: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO meta (key, value, updated_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
               value = CAST(CAST(value AS INTEGER) + ?2 AS TEXT),
               updated_time = excluded.updated_time",
            params![key, delta.to_string(), now_ts()],
        )
        .map_err(sql_err)?;
        let raw: String = conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |r| {
                r.get(0)
            })
            .map_err(sql_err)?;
        Ok(raw.parse::<i64>().unwrap_or(0))
    }

    pub fn delete_meta_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        conn.execute(
            "DELETE FROM meta WHERE key LIKE ?1 ESCAPE '\\'",
            params![pattern],
        )
        .map_err(sql_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Chat history
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn append_chat(&self, user_id: &str, record: &ChatRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chat_history
               (user_id, session_id, role, content, reasoning_content, meta, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user_id,
                record.session_id,
                record.role,
                json_text(&record.content)?,
                record.reasoning_content,
                record.meta.as_ref().map(json_text).transpose()?,
                record.timestamp,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Load chat rows for a session in insertion order. With a limit, the
    /// tail window is returned (still ascending).
    pub fn load_chat_history(
        &self,
        user_id: &str,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ChatRecord>> {
        let conn = self.conn.lock();
        let sql = match limit {
            Some(_) => {
                "SELECT role, content, reasoning_content, meta, timestamp FROM (
                     SELECT id, role, content, reasoning_content, meta, timestamp
                     FROM chat_history
                     WHERE user_id = ?1 AND session_id = ?2
                     ORDER BY id DESC LIMIT ?3
                 ) ORDER BY id ASC"
            }
            None => {
                "SELECT role, content, reasoning_content, meta, timestamp
                 FROM chat_history
                 WHERE user_id = ?1 AND session_id = ?2 AND ?3 >= 0
                 ORDER BY id ASC"
            }
        };
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let limit_param = limit.map(|l| l as i64).unwrap_or(0);
        let rows = stmt
            .query_map(params![user_id, session_id, limit_param], |row| {
                Ok(ChatRecord {
                    role: row.get(0)?,
                    content: parse_json_text(row.get::<_, Option<String>>(1)?),
                    reasoning_content: row.get(2)?,
                    meta: row
                        .get::<_, Option<String>>(3)?
                        .and_then(|raw| serde_json::from_str(&raw).ok()),
                    timestamp: row.get(4)?,
                    session_id: session_id.to_string(),
                })
            })
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Latest persisted system prompt row for a session, if any.
    pub fn load_session_system_prompt(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<ChatRecord>> {
        let history = self.load_chat_history(user_id, session_id, None)?;
        Ok(history
            .into_iter()
            .rev()
            .find(|r| r.role == "system" && r.meta_type() == Some("system_prompt")))
    }

    pub fn delete_chat_history_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM chat_history WHERE user_id = ?1", params![user_id])
            .map_err(sql_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Tool and artifact logs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn append_tool_log(&self, user_id: &str, record: &ToolLogRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tool_logs
               (user_id, session_id, tool, ok, error, args, data, sandbox, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user_id,
                record.session_id,
                record.tool,
                record.ok,
                record.error,
                json_text(&record.args)?,
                json_text(&record.data)?,
                record.sandbox,
                record.timestamp,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn delete_tool_logs_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM tool_logs WHERE user_id = ?1", params![user_id])
            .map_err(sql_err)
    }

    pub fn append_artifact_log(&self, user_id: &str, record: &ArtifactRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO artifact_logs
               (user_id, session_id, kind, action, name, ok, error, meta, tool, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user_id,
                record.session_id,
                record.kind,
                record.action,
                record.name,
                record.ok,
                record.error,
                json_text(&record.meta)?,
                record.tool,
                record.timestamp,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Last `limit` artifact rows for a session, ascending.
    pub fn load_artifact_logs(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ArtifactRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT kind, action, name, ok, error, meta, tool, timestamp FROM (
                     SELECT id, kind, action, name, ok, error, meta, tool, timestamp
                     FROM artifact_logs
                     WHERE user_id = ?1 AND session_id = ?2
                     ORDER BY id DESC LIMIT ?3
                 ) ORDER BY id ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![user_id, session_id, limit as i64], |row| {
                Ok(ArtifactRecord {
                    kind: row.get(0)?,
                    action: row.get(1)?,
                    name: row.get(2)?,
                    ok: row.get(3)?,
                    error: row.get(4)?,
                    meta: parse_json_text(row.get::<_, Option<String>>(5)?),
                    tool: row.get(6)?,
                    timestamp: row.get(7)?,
                    session_id: session_id.to_string(),
                })
            })
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn delete_artifact_logs_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM artifact_logs WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Monitor snapshots
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn upsert_monitor_record(
        &self,
        session_id: &str,
        user_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO monitor_sessions (session_id, user_id, payload, updated_time)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(session_id) DO UPDATE SET
               user_id = excluded.user_id,
               payload = excluded.payload,
               updated_time = excluded.updated_time",
            params![session_id, user_id, json_text(payload)?, now_ts()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn load_monitor_records(&self) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT payload FROM monitor_sessions ORDER BY updated_time ASC")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| Ok(parse_json_text(row.get::<_, Option<String>>(0)?)))
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn delete_monitor_record(&self, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM monitor_sessions WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(sql_err)
    }

    pub fn delete_monitor_records_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM monitor_sessions WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // System logs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn write_system_log(
        &self,
        level: &str,
        logger: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_logs (created_at, level, logger, message, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                created_at,
                level,
                logger,
                message,
                payload.map(json_text).transpose()?,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Retention
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Delete rows older than `retention_days` across the log-like
    /// tables. Returns per-table deletion counts.
    pub fn cleanup_retention(
        &self,
        retention_days: u32,
    ) -> Result<std::collections::HashMap<&'static str, usize>> {
        let cutoff = now_ts() - retention_days as f64 * 86_400.0;
        let cutoff_iso = (Utc::now()
            - chrono::Duration::seconds(retention_days as i64 * 86_400))
        .to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.conn.lock();
        let mut deleted = std::collections::HashMap::new();
        for (table, sql) in [
            ("chat_history", "DELETE FROM chat_history WHERE timestamp < ?1"),
            ("tool_logs", "DELETE FROM tool_logs WHERE timestamp < ?1"),
            ("artifact_logs", "DELETE FROM artifact_logs WHERE timestamp < ?1"),
            ("monitor_sessions", "DELETE FROM monitor_sessions WHERE updated_time < ?1"),
            ("stream_events", "DELETE FROM stream_events WHERE created_time < ?1"),
        ] {
            let count = conn.execute(sql, params![cutoff]).map_err(sql_err)?;
            deleted.insert(table, count);
        }
        let count = conn
            .execute(
                "DELETE FROM system_logs WHERE created_at < ?1",
                params![cutoff_iso],
            )
            .map_err(sql_err)?;
        deleted.insert("system_logs", count);
        tracing::debug!(?deleted, retention_days, "retention sweep complete");
        Ok(deleted)
    }
}

pub(crate) fn json_text(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string(value).map_err(Error::from)
}

pub(crate) fn parse_json_text(raw: Option<String>) -> serde_json::Value {
    match raw {
        Some(text) => {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        }
        None => serde_json::Value::Null,
    }
}
