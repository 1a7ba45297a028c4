//! Cross-process session lock table — the serialization point for
//! admission. The acquire path runs inside one immediate transaction so
//! the expiry purge, per-user check, global count, and insert cannot
//! interleave with a concurrent acquirer.

use rusqlite::{params, TransactionBehavior};

use relay_domain::Result;

use crate::{now_ts, sql_err, Storage};

/// Outcome of one lock acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Another live session holds this user's slot.
    UserBusy,
    /// The global active-session cap is reached; transient.
    GlobalBusy,
}

impl Storage {
    /// Try to acquire the session lock. Purges expired rows first, then
    /// rejects on per-user exclusivity, then on the global cap.
    pub fn try_acquire_session_lock(
        &self,
        session_id: &str,
        user_id: &str,
        max_active: usize,
        ttl_s: f64,
    ) -> Result<LockOutcome> {
        let session_id = session_id.trim();
        let user_id = user_id.trim();
        if session_id.is_empty() || user_id.is_empty() {
            return Ok(LockOutcome::UserBusy);
        }
        let max_active = max_active.max(1);
        let ttl_s = ttl_s.max(1.0);
        let now = now_ts();

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_err)?;

        tx.execute(
            "DELETE FROM session_locks WHERE expires_at <= ?1",
            params![now],
        )
        .map_err(sql_err)?;

        let user_held: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM session_locks WHERE user_id = ?1)",
                params![user_id],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if user_held {
            // Implicit rollback keeps the purge uncommitted too, which is
            // fine: the next acquirer repeats it.
            return Ok(LockOutcome::UserBusy);
        }

        let total: i64 = tx
            .query_row("SELECT COUNT(*) FROM session_locks", [], |row| row.get(0))
            .map_err(sql_err)?;
        if total as usize >= max_active {
            return Ok(LockOutcome::GlobalBusy);
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO session_locks
               (session_id, user_id, created_time, updated_time, expires_at)
             VALUES (?1, ?2, ?3, ?3, ?4)",
            params![session_id, user_id, now, now + ttl_s],
        );
        match inserted {
            Ok(1) => {
                tx.commit().map_err(sql_err)?;
                Ok(LockOutcome::Acquired)
            }
            // Same session_id already live (re-submission while running).
            Ok(_) => Ok(LockOutcome::UserBusy),
            Err(e) => Err(sql_err(e)),
        }
    }

    /// Renew a held lock's TTL (heartbeat).
    pub fn touch_session_lock(&self, session_id: &str, ttl_s: f64) -> Result<()> {
        let now = now_ts();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE session_locks SET updated_time = ?1, expires_at = ?2
             WHERE session_id = ?3",
            params![now, now + ttl_s.max(1.0), session_id],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Release a lock. Idempotent.
    pub fn release_session_lock(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_locks WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn delete_session_locks_by_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM session_locks WHERE user_id = ?1",
            params![user_id],
        )
        .map_err(sql_err)
    }

    /// Current live lock count (tests and metrics).
    pub fn count_session_locks(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM session_locks", [], |row| row.get(0))
            .map_err(sql_err)?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_user_busy() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(
            storage.try_acquire_session_lock("s1", "u1", 4, 60.0).unwrap(),
            LockOutcome::Acquired
        );
        // same user, different session
        assert_eq!(
            storage.try_acquire_session_lock("s2", "u1", 4, 60.0).unwrap(),
            LockOutcome::UserBusy
        );
        // same session re-submission
        assert_eq!(
            storage.try_acquire_session_lock("s1", "u1", 4, 60.0).unwrap(),
            LockOutcome::UserBusy
        );
    }

    #[test]
    fn global_cap_rejects_new_users() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(
            storage.try_acquire_session_lock("s1", "u1", 1, 60.0).unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(
            storage.try_acquire_session_lock("s2", "u2", 1, 60.0).unwrap(),
            LockOutcome::GlobalBusy
        );
        storage.release_session_lock("s1").unwrap();
        assert_eq!(
            storage.try_acquire_session_lock("s2", "u2", 1, 60.0).unwrap(),
            LockOutcome::Acquired
        );
    }

    #[test]
    fn expired_rows_are_swept_on_acquire() {
        let storage = Storage::open_in_memory().unwrap();
        // TTL clamps to 1s; backdate the row manually to force expiry.
        assert_eq!(
            storage.try_acquire_session_lock("s1", "u1", 1, 60.0).unwrap(),
            LockOutcome::Acquired
        );
        {
            let conn = storage.conn.lock();
            conn.execute(
                "UPDATE session_locks SET expires_at = ?1",
                params![now_ts() - 5.0],
            )
            .unwrap();
        }
        assert_eq!(
            storage.try_acquire_session_lock("s2", "u2", 1, 60.0).unwrap(),
            LockOutcome::Acquired
        );
        assert_eq!(storage.count_session_locks().unwrap(), 1);
    }

    #[test]
    fn release_is_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        storage.try_acquire_session_lock("s1", "u1", 4, 60.0).unwrap();
        storage.release_session_lock("s1").unwrap();
        storage.release_session_lock("s1").unwrap();
        assert_eq!(storage.count_session_locks().unwrap(), 0);
    }

    #[test]
    fn touch_extends_expiry() {
        let storage = Storage::open_in_memory().unwrap();
        storage.try_acquire_session_lock("s1", "u1", 4, 60.0).unwrap();
        let before: f64 = {
            let conn = storage.conn.lock();
            conn.query_row("SELECT expires_at FROM session_locks", [], |r| r.get(0))
                .unwrap()
        };
        storage.touch_session_lock("s1", 600.0).unwrap();
        let after: f64 = {
            let conn = storage.conn.lock();
            conn.query_row("SELECT expires_at FROM session_locks", [], |r| r.get(0))
                .unwrap()
        };
        assert!(after > before);
    }

    #[test]
    fn blank_ids_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(
            storage.try_acquire_session_lock("", "u1", 4, 60.0).unwrap(),
            LockOutcome::UserBusy
        );
        assert_eq!(
            storage.try_acquire_session_lock("s1", "  ", 4, 60.0).unwrap(),
            LockOutcome::UserBusy
        );
    }

    #[test]
    fn delete_by_user_frees_slot() {
        let storage = Storage::open_in_memory().unwrap();
        storage.try_acquire_session_lock("s1", "u1", 4, 60.0).unwrap();
        assert_eq!(storage.delete_session_locks_by_user("u1").unwrap(), 1);
        assert_eq!(
            storage.try_acquire_session_lock("s9", "u1", 4, 60.0).unwrap(),
            LockOutcome::Acquired
        );
    }
}
