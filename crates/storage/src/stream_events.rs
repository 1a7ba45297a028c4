//! Overflow rows for the stream event bus. Written only when the bounded
//! in-memory queue rejects a push; the SSE consumer replays them in
//! `event_id` order to close any gaps.

use rusqlite::params;

use relay_domain::Result;

use crate::{json_text, now_ts, parse_json_text, sql_err, Storage};

impl Storage {
    /// Insert one overflow event. `(session_id, event_id)` is the primary
    /// key; a duplicate insert is ignored (replay already covers it).
    pub fn append_stream_event(
        &self,
        session_id: &str,
        event_id: u64,
        user_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO stream_events
               (session_id, event_id, user_id, payload, created_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                event_id as i64,
                user_id,
                json_text(payload)?,
                now_ts()
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Fetch overflow rows with `event_id > after_event_id`, ascending,
    /// up to `limit`.
    pub fn load_stream_events(
        &self,
        session_id: &str,
        after_event_id: u64,
        limit: usize,
    ) -> Result<Vec<(u64, serde_json::Value)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT event_id, payload FROM stream_events
                 WHERE session_id = ?1 AND event_id > ?2
                 ORDER BY event_id ASC LIMIT ?3",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(
                params![session_id, after_event_id as i64, limit as i64],
                |row| {
                    let event_id: i64 = row.get(0)?;
                    let payload = parse_json_text(row.get::<_, Option<String>>(1)?);
                    Ok((event_id as u64, payload))
                },
            )
            .map_err(sql_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Garbage-collect overflow rows older than `before_time`.
    pub fn delete_stream_events_before(&self, before_time: f64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM stream_events WHERE created_time < ?1",
            params![before_time],
        )
        .map_err(sql_err)
    }

    pub fn delete_stream_events_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM stream_events WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u64) -> serde_json::Value {
        serde_json::json!({"type": "progress", "n": n})
    }

    #[test]
    fn append_and_load_after_cursor() {
        let storage = Storage::open_in_memory().unwrap();
        for id in 1..=5u64 {
            storage
                .append_stream_event("s1", id, "u1", &payload(id))
                .unwrap();
        }
        let rows = storage.load_stream_events("s1", 2, 10).unwrap();
        let ids: Vec<u64> = rows.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(rows[0].1["n"], 3);
    }

    #[test]
    fn load_respects_limit() {
        let storage = Storage::open_in_memory().unwrap();
        for id in 1..=10u64 {
            storage
                .append_stream_event("s1", id, "u1", &payload(id))
                .unwrap();
        }
        let rows = storage.load_stream_events("s1", 0, 4).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows.last().unwrap().0, 4);
    }

    #[test]
    fn duplicate_event_id_ignored() {
        let storage = Storage::open_in_memory().unwrap();
        storage.append_stream_event("s1", 1, "u1", &payload(1)).unwrap();
        storage
            .append_stream_event("s1", 1, "u1", &payload(99))
            .unwrap();
        let rows = storage.load_stream_events("s1", 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1["n"], 1);
    }

    #[test]
    fn gc_and_user_purge() {
        let storage = Storage::open_in_memory().unwrap();
        storage.append_stream_event("s1", 1, "u1", &payload(1)).unwrap();
        storage.append_stream_event("s2", 1, "u2", &payload(1)).unwrap();
        assert_eq!(storage.delete_stream_events_before(now_ts() + 1.0).unwrap(), 2);

        storage.append_stream_event("s1", 2, "u1", &payload(2)).unwrap();
        storage.append_stream_event("s2", 2, "u2", &payload(2)).unwrap();
        assert_eq!(storage.delete_stream_events_by_user("u1").unwrap(), 1);
        assert_eq!(storage.load_stream_events("s2", 0, 10).unwrap().len(), 1);
    }
}
