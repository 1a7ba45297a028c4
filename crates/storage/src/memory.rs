//! Long-term memory persistence: the per-user enable switch, capped
//! memory records, and the task log written by the summarizer worker.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use relay_domain::Result;

use crate::{now_ts, sql_err, Storage};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub user_id: String,
    pub session_id: String,
    pub summary: String,
    pub created_time: f64,
    pub updated_time: f64,
}

/// One row per `(user, session)` — most-recent-wins on re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTaskLog {
    pub task_id: String,
    pub user_id: String,
    pub session_id: String,
    pub status: String,
    pub queued_time: f64,
    pub started_time: f64,
    pub finished_time: f64,
    pub elapsed_s: f64,
    #[serde(default)]
    pub request_payload: String,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub error: String,
    pub updated_time: f64,
}

impl Storage {
    // ── Memory settings ────────────────────────────────────────────

    pub fn get_memory_enabled(&self, user_id: &str) -> Result<Option<bool>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT enabled FROM memory_settings WHERE user_id = ?1",
            params![user_id],
            |row| row.get::<_, bool>(0),
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn set_memory_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_settings (user_id, enabled, updated_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
               enabled = excluded.enabled,
               updated_time = excluded.updated_time",
            params![user_id, enabled, now_ts()],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn delete_memory_settings_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memory_settings WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }

    // ── Memory records ─────────────────────────────────────────────

    /// Upsert a memory record and enforce the per-user cap in the same
    /// transaction, evicting least-recently-updated rows. Task logs for
    /// evicted sessions go with them.
    pub fn upsert_memory_record(
        &self,
        user_id: &str,
        session_id: &str,
        summary: &str,
        max_records: usize,
    ) -> Result<()> {
        let user_id = user_id.trim();
        let session_id = session_id.trim();
        let summary = summary.trim();
        if user_id.is_empty() || session_id.is_empty() || summary.is_empty() {
            return Ok(());
        }
        let limit = max_records.max(1);
        let now = now_ts();

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(sql_err)?;
        tx.execute(
            "INSERT INTO memory_records
               (user_id, session_id, summary, created_time, updated_time)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id, session_id) DO UPDATE SET
               summary = excluded.summary,
               updated_time = excluded.updated_time",
            params![user_id, session_id, summary, now],
        )
        .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM memory_records
             WHERE user_id = ?1
               AND id NOT IN (
                 SELECT id FROM memory_records
                 WHERE user_id = ?1
                 ORDER BY updated_time DESC, id DESC
                 LIMIT ?2
               )",
            params![user_id, limit as i64],
        )
        .map_err(sql_err)?;
        tx.execute(
            "DELETE FROM memory_task_logs
             WHERE user_id = ?1
               AND session_id NOT IN (
                 SELECT session_id FROM memory_records WHERE user_id = ?1
               )",
            params![user_id],
        )
        .map_err(sql_err)?;
        tx.commit().map_err(sql_err)
    }

    pub fn load_memory_records(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, summary, created_time, updated_time
                 FROM memory_records
                 WHERE user_id = ?1
                 ORDER BY updated_time DESC, id DESC
                 LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(MemoryRecord {
                    user_id: user_id.to_string(),
                    session_id: row.get(0)?,
                    summary: row.get(1)?,
                    created_time: row.get(2)?,
                    updated_time: row.get(3)?,
                })
            })
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Per-user record count and latest update time.
    pub fn memory_record_stats(&self) -> Result<Vec<(String, usize, f64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, COUNT(*), MAX(updated_time)
                 FROM memory_records GROUP BY user_id",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)? as usize,
                    row.get::<_, f64>(2)?,
                ))
            })
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn delete_memory_record(&self, user_id: &str, session_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memory_records WHERE user_id = ?1 AND session_id = ?2",
            params![user_id, session_id],
        )
        .map_err(sql_err)
    }

    pub fn delete_memory_records_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memory_records WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }

    // ── Memory task logs ───────────────────────────────────────────

    pub fn upsert_memory_task_log(&self, log: &MemoryTaskLog) -> Result<()> {
        if log.task_id.is_empty() || log.user_id.is_empty() || log.session_id.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_task_logs
               (task_id, user_id, session_id, status, queued_time, started_time,
                finished_time, elapsed_s, request_payload, result, error, updated_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(user_id, session_id) DO UPDATE SET
               task_id = excluded.task_id,
               status = excluded.status,
               queued_time = excluded.queued_time,
               started_time = excluded.started_time,
               finished_time = excluded.finished_time,
               elapsed_s = excluded.elapsed_s,
               request_payload = excluded.request_payload,
               result = excluded.result,
               error = excluded.error,
               updated_time = excluded.updated_time",
            params![
                log.task_id,
                log.user_id,
                log.session_id,
                log.status,
                log.queued_time,
                log.started_time,
                log.finished_time,
                log.elapsed_s,
                log.request_payload,
                log.result,
                log.error,
                log.updated_time,
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn load_memory_task_logs(&self, limit: Option<usize>) -> Result<Vec<MemoryTaskLog>> {
        let conn = self.conn.lock();
        let sql = "SELECT task_id, user_id, session_id, status, queued_time, started_time,
                          finished_time, elapsed_s, request_payload, result, error, updated_time
                   FROM memory_task_logs
                   ORDER BY updated_time DESC, id DESC
                   LIMIT ?1";
        let limit = limit.map(|l| l.max(1) as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params![limit], map_task_log)
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    pub fn load_memory_task_log_by_task_id(
        &self,
        task_id: &str,
    ) -> Result<Option<MemoryTaskLog>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT task_id, user_id, session_id, status, queued_time, started_time,
                    finished_time, elapsed_s, request_payload, result, error, updated_time
             FROM memory_task_logs
             WHERE task_id = ?1
             ORDER BY updated_time DESC, id DESC
             LIMIT 1",
            params![task_id],
            map_task_log,
        )
        .optional()
        .map_err(sql_err)
    }

    pub fn delete_memory_task_logs_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memory_task_logs WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }
}

fn map_task_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryTaskLog> {
    Ok(MemoryTaskLog {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        status: row.get(3)?,
        queued_time: row.get(4)?,
        started_time: row.get(5)?,
        finished_time: row.get(6)?,
        elapsed_s: row.get(7)?,
        request_payload: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        result: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        error: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        updated_time: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_enabled_roundtrip() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.get_memory_enabled("u1").unwrap().is_none());
        storage.set_memory_enabled("u1", true).unwrap();
        assert_eq!(storage.get_memory_enabled("u1").unwrap(), Some(true));
        storage.set_memory_enabled("u1", false).unwrap();
        assert_eq!(storage.get_memory_enabled("u1").unwrap(), Some(false));
    }

    #[test]
    fn upsert_overwrites_same_session() {
        let storage = Storage::open_in_memory().unwrap();
        storage.upsert_memory_record("u1", "s1", "first", 30).unwrap();
        storage.upsert_memory_record("u1", "s1", "second", 30).unwrap();
        let records = storage.load_memory_records("u1", 10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].summary, "second");
    }

    #[test]
    fn cap_evicts_least_recently_updated() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..5 {
            storage
                .upsert_memory_record("u1", &format!("s{i}"), &format!("sum{i}"), 3)
                .unwrap();
        }
        let records = storage.load_memory_records("u1", 10).unwrap();
        assert_eq!(records.len(), 3);
        let sessions: Vec<&str> = records.iter().map(|r| r.session_id.as_str()).collect();
        assert!(sessions.contains(&"s4"));
        assert!(!sessions.contains(&"s0"));
        assert!(!sessions.contains(&"s1"));
    }

    #[test]
    fn eviction_cascades_to_task_logs() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..3 {
            let session = format!("s{i}");
            storage
                .upsert_memory_task_log(&MemoryTaskLog {
                    task_id: format!("t{i}"),
                    user_id: "u1".into(),
                    session_id: session.clone(),
                    status: "finished".into(),
                    queued_time: i as f64,
                    started_time: i as f64,
                    finished_time: i as f64 + 1.0,
                    elapsed_s: 1.0,
                    request_payload: String::new(),
                    result: "ok".into(),
                    error: String::new(),
                    updated_time: i as f64,
                })
                .unwrap();
            storage
                .upsert_memory_record("u1", &session, &format!("sum{i}"), 2)
                .unwrap();
        }
        let logs = storage.load_memory_task_logs(None).unwrap();
        // s0's record was evicted by the cap, so its task log is gone too.
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.session_id != "s0"));
    }

    #[test]
    fn task_log_most_recent_wins() {
        let storage = Storage::open_in_memory().unwrap();
        let mut log = MemoryTaskLog {
            task_id: "t1".into(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            status: "queued".into(),
            queued_time: 1.0,
            started_time: 0.0,
            finished_time: 0.0,
            elapsed_s: 0.0,
            request_payload: String::new(),
            result: String::new(),
            error: String::new(),
            updated_time: 1.0,
        };
        storage.upsert_memory_task_log(&log).unwrap();
        log.task_id = "t2".into();
        log.status = "finished".into();
        log.updated_time = 2.0;
        storage.upsert_memory_task_log(&log).unwrap();

        let logs = storage.load_memory_task_logs(Some(10)).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].task_id, "t2");
        assert_eq!(logs[0].status, "finished");

        let by_id = storage.load_memory_task_log_by_task_id("t2").unwrap().unwrap();
        assert_eq!(by_id.session_id, "s1");
        assert!(storage.load_memory_task_log_by_task_id("t1").unwrap().is_none());
    }

    #[test]
    fn user_purge() {
        let storage = Storage::open_in_memory().unwrap();
        storage.upsert_memory_record("u1", "s1", "x", 30).unwrap();
        storage.set_memory_enabled("u1", true).unwrap();
        assert_eq!(storage.delete_memory_records_by_user("u1").unwrap(), 1);
        assert_eq!(storage.delete_memory_settings_by_user("u1").unwrap(), 1);
        assert!(storage.load_memory_records("u1", 10).unwrap().is_empty());
    }
}
