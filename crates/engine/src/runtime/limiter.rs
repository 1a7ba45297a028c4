//! Admission control over the cross-process session lock table.
//!
//! `acquire` polls the storage lock until it wins a slot or learns the
//! user already holds one. `user_busy` fails fast (per-user exclusivity
//! is permanent for the life of the other session); `global_busy` is
//! transient, so the caller keeps waiting. A heartbeat task renews the
//! lock TTL for as long as the request runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use relay_domain::constants::{
    SESSION_LOCK_HEARTBEAT_S, SESSION_LOCK_POLL_INTERVAL_S, SESSION_LOCK_TTL_S,
};
use relay_domain::{Error, Result};
use relay_storage::{LockOutcome, Storage};

/// Point-in-time limiter counters for metrics.
#[derive(Debug, Clone, Copy)]
pub struct LimiterSnapshot {
    pub max_active: usize,
    pub active: usize,
    pub waiting: usize,
    pub last_wait_ms: f64,
}

#[derive(Default)]
struct LimiterStats {
    active: usize,
    waiting: usize,
    last_wait_ms: f64,
}

pub struct RequestLimiter {
    storage: Storage,
    max_active: Mutex<usize>,
    poll_interval: Duration,
    lock_ttl_s: f64,
    stats: Mutex<LimiterStats>,
}

impl RequestLimiter {
    pub fn new(storage: Storage, max_active: usize) -> Arc<Self> {
        Arc::new(Self {
            storage,
            max_active: Mutex::new(max_active.max(1)),
            poll_interval: Duration::from_secs_f64(SESSION_LOCK_POLL_INTERVAL_S),
            lock_ttl_s: SESSION_LOCK_TTL_S,
            stats: Mutex::new(LimiterStats::default()),
        })
    }

    pub fn set_max_active(&self, max_active: usize) {
        *self.max_active.lock() = max_active.max(1);
    }

    pub fn lock_ttl_s(&self) -> f64 {
        self.lock_ttl_s
    }

    /// Acquire the session permit. Returns `false` when the user already
    /// has a live session; waits out global contention indefinitely (the
    /// heartbeat of whoever holds the slots keeps their locks fresh).
    pub async fn acquire(&self, session_id: &str, user_id: &str) -> Result<bool> {
        if session_id.is_empty() || user_id.is_empty() {
            return Ok(false);
        }
        self.stats.lock().waiting += 1;
        let started = Instant::now();
        let result = self.acquire_inner(session_id, user_id).await;
        {
            let mut stats = self.stats.lock();
            stats.waiting = stats.waiting.saturating_sub(1);
            if let Ok(true) = result {
                stats.active += 1;
                stats.last_wait_ms = started.elapsed().as_secs_f64() * 1000.0;
            }
        }
        result
    }

    async fn acquire_inner(&self, session_id: &str, user_id: &str) -> Result<bool> {
        loop {
            let storage = self.storage.clone();
            let session = session_id.to_string();
            let user = user_id.to_string();
            let max_active = *self.max_active.lock();
            let ttl = self.lock_ttl_s;
            let outcome = tokio::task::spawn_blocking(move || {
                storage.try_acquire_session_lock(&session, &user, max_active, ttl)
            })
            .await
            .map_err(|e| Error::Internal(format!("lock task: {e}")))??;

            match outcome {
                LockOutcome::Acquired => return Ok(true),
                LockOutcome::UserBusy => return Ok(false),
                LockOutcome::GlobalBusy => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Renew the lock TTL.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let storage = self.storage.clone();
        let session = session_id.to_string();
        let ttl = self.lock_ttl_s;
        tokio::task::spawn_blocking(move || storage.touch_session_lock(&session, ttl))
            .await
            .map_err(|e| Error::Internal(format!("lock task: {e}")))?
    }

    /// Release the permit. Idempotent; called on every exit path.
    pub async fn release(&self, session_id: &str) {
        let storage = self.storage.clone();
        let session = session_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || storage.release_session_lock(&session)).await;
        match result {
            Ok(Err(e)) => tracing::warn!(session_id, error = %e, "lock release failed"),
            Err(e) => tracing::warn!(session_id, error = %e, "lock release task failed"),
            Ok(Ok(())) => {}
        }
        let mut stats = self.stats.lock();
        stats.active = stats.active.saturating_sub(1);
    }

    /// Spawn the heartbeat task for a held lock. The task runs until
    /// aborted; the lock TTL stays ≥ 2× the heartbeat period.
    pub fn spawn_heartbeat(self: &Arc<Self>, session_id: &str) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let session = session_id.to_string();
        tokio::spawn(async move {
            let period = Duration::from_secs_f64(SESSION_LOCK_HEARTBEAT_S);
            loop {
                tokio::time::sleep(period).await;
                if let Err(e) = limiter.touch(&session).await {
                    tracing::warn!(session_id = %session, error = %e, "lock heartbeat failed");
                }
            }
        })
    }

    pub fn snapshot(&self) -> LimiterSnapshot {
        let stats = self.stats.lock();
        LimiterSnapshot {
            max_active: *self.max_active.lock(),
            active: stats.active,
            waiting: stats.waiting,
            last_wait_ms: stats.last_wait_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_active: usize) -> (Storage, Arc<RequestLimiter>) {
        let storage = Storage::open_in_memory().unwrap();
        let limiter = RequestLimiter::new(storage.clone(), max_active);
        (storage, limiter)
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let (storage, limiter) = limiter(4);
        assert!(limiter.acquire("s1", "u1").await.unwrap());
        assert_eq!(storage.count_session_locks().unwrap(), 1);
        limiter.release("s1").await;
        assert_eq!(storage.count_session_locks().unwrap(), 0);
    }

    #[tokio::test]
    async fn user_busy_fails_fast() {
        let (_storage, limiter) = limiter(4);
        assert!(limiter.acquire("s1", "u1").await.unwrap());
        // second session for the same user returns immediately
        assert!(!limiter.acquire("s2", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn global_busy_waits_until_released() {
        let (_storage, limiter) = limiter(1);
        assert!(limiter.acquire("s1", "u1").await.unwrap());

        let waiter = Arc::clone(&limiter);
        let handle = tokio::spawn(async move { waiter.acquire("s2", "u2").await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());

        limiter.release("s1").await;
        let acquired = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(acquired);
    }

    #[tokio::test]
    async fn snapshot_tracks_active() {
        let (_storage, limiter) = limiter(4);
        limiter.acquire("s1", "u1").await.unwrap();
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.waiting, 0);
        assert_eq!(snapshot.max_active, 4);
        limiter.release("s1").await;
        assert_eq!(limiter.snapshot().active, 0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_storage, limiter) = limiter(4);
        limiter.acquire("s1", "u1").await.unwrap();
        limiter.release("s1").await;
        limiter.release("s1").await;
        assert!(limiter.acquire("s1", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn blank_ids_rejected() {
        let (_storage, limiter) = limiter(4);
        assert!(!limiter.acquire("", "u1").await.unwrap());
        assert!(!limiter.acquire("s1", "").await.unwrap());
    }
}
