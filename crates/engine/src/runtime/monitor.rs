//! In-memory session registry with bounded event rings and durable
//! snapshots.
//!
//! The monitor is the process-wide source of truth for "what is this
//! session doing right now": status, stage, summary, rounds, token usage,
//! and the cancellation flag the loop polls at every checkpoint. Records
//! are persisted on every status transition so restarts can recover.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use relay_domain::chat::Usage;
use relay_domain::config::ObservabilityConfig;
use relay_domain::event::EventType;
use relay_storage::{now_ts, Storage};

use super::sanitize_payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Cancelling,
    Finished,
    Error,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub timestamp: f64,
    pub event_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub question: String,
    pub status: SessionStatus,
    pub stage: String,
    pub summary: String,
    pub start_time: f64,
    pub updated_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_time: Option<f64>,
    pub rounds: u32,
    #[serde(default)]
    pub token_usage: Usage,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub events: VecDeque<MonitorEvent>,
}

struct MonitorInner {
    sessions: HashMap<String, SessionRecord>,
    /// Sessions force-cancelled by a user purge; consulted even after the
    /// record itself is gone.
    forced_cancel: HashSet<String>,
}

pub struct SessionMonitor {
    inner: Mutex<MonitorInner>,
    config: Mutex<ObservabilityConfig>,
    storage: Storage,
}

impl SessionMonitor {
    pub fn new(storage: Storage, config: ObservabilityConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MonitorInner {
                sessions: HashMap::new(),
                forced_cancel: HashSet::new(),
            }),
            config: Mutex::new(config),
            storage,
        })
    }

    pub fn set_observability(&self, config: ObservabilityConfig) {
        *self.config.lock() = config;
    }

    /// Register a session, enforcing in-process per-user exclusivity.
    /// Re-registering an existing session increments its round counter.
    pub fn try_register(&self, session_id: &str, user_id: &str, question: &str) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock();
            let user_active = inner.sessions.values().any(|record| {
                record.user_id == user_id
                    && record.session_id != session_id
                    && record.status.is_active()
            });
            if user_active {
                return false;
            }
            // A successful re-register supersedes any stale forced-cancel
            // marker for this id.
            inner.forced_cancel.remove(session_id);
            let now = now_ts();
            let record = inner
                .sessions
                .entry(session_id.to_string())
                .and_modify(|record| {
                    record.status = SessionStatus::Running;
                    record.stage = "received".into();
                    record.summary.clear();
                    record.question = question.to_string();
                    record.updated_time = now;
                    record.ended_time = None;
                    record.cancel_requested = false;
                    record.rounds += 1;
                })
                .or_insert_with(|| SessionRecord {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    question: question.to_string(),
                    status: SessionStatus::Running,
                    stage: "received".into(),
                    summary: String::new(),
                    start_time: now,
                    updated_time: now,
                    ended_time: None,
                    rounds: 1,
                    token_usage: Usage::default(),
                    cancel_requested: false,
                    events: VecDeque::new(),
                });
            record.clone()
        };
        self.persist(&snapshot);
        true
    }

    /// Record an event: derive stage/summary for well-known types, cap
    /// the payload, drop configured types, and append to the ring.
    pub fn record_event(&self, session_id: &str, event_type: EventType, data: &serde_json::Value) {
        let (event_limit, payload_max, dropped) = {
            let config = self.config.lock();
            (
                config.monitor_event_limit,
                config.monitor_payload_max_chars,
                config
                    .monitor_drop_event_types
                    .iter()
                    .any(|t| t == event_type.as_str()),
            )
        };

        let mut inner = self.inner.lock();
        let Some(record) = inner.sessions.get_mut(session_id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }
        record.updated_time = now_ts();

        match event_type {
            EventType::ToolCall => {
                record.stage = "tool_call".into();
                let tool = data.get("tool").and_then(|v| v.as_str()).unwrap_or("");
                record.summary = format!("call({tool})");
            }
            EventType::LlmRequest => record.stage = "llm_request".into(),
            EventType::Final => record.stage = "final".into(),
            EventType::Error => {
                record.stage = "error".into();
                record.summary = data
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
            }
            EventType::TokenUsage => {
                if let Ok(usage) = serde_json::from_value::<Usage>(data.clone()) {
                    record.token_usage = usage;
                }
            }
            EventType::Compaction => record.stage = "compacting".into(),
            _ => {}
        }

        if dropped {
            return;
        }
        record.events.push_back(MonitorEvent {
            timestamp: record.updated_time,
            event_type: event_type.as_str().to_string(),
            data: sanitize_payload(data, payload_max),
        });
        while record.events.len() > event_limit {
            record.events.pop_front();
        }
    }

    // ── Status transitions ─────────────────────────────────────────

    pub fn mark_finished(&self, session_id: &str) {
        self.transition(session_id, SessionStatus::Finished, None);
    }

    pub fn mark_error(&self, session_id: &str, message: &str) {
        self.transition(session_id, SessionStatus::Error, Some(message));
    }

    pub fn mark_cancelled(&self, session_id: &str) {
        self.transition(session_id, SessionStatus::Cancelled, None);
    }

    fn transition(&self, session_id: &str, status: SessionStatus, summary: Option<&str>) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.sessions.get_mut(session_id) else {
                return;
            };
            if record.status.is_terminal() {
                return;
            }
            record.status = status;
            record.updated_time = now_ts();
            record.ended_time = Some(record.updated_time);
            record.stage = match status {
                SessionStatus::Finished => "final".into(),
                SessionStatus::Error => "error".into(),
                SessionStatus::Cancelled => "cancelled".into(),
                _ => record.stage.clone(),
            };
            if let Some(summary) = summary {
                record.summary = summary.to_string();
            }
            record.clone()
        };
        self.persist(&snapshot);
    }

    /// Request cancellation: flips the flag, moves status to cancelling,
    /// and persists. Returns false for unknown or already-terminal ids.
    pub fn cancel(&self, session_id: &str) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.sessions.get_mut(session_id) else {
                return false;
            };
            if record.status.is_terminal() {
                return false;
            }
            record.cancel_requested = true;
            record.status = SessionStatus::Cancelling;
            record.updated_time = now_ts();
            record.clone()
        };
        self.persist(&snapshot);
        true
    }

    pub fn is_cancelled(&self, session_id: &str) -> bool {
        let inner = self.inner.lock();
        if inner.forced_cancel.contains(session_id) {
            return true;
        }
        inner
            .sessions
            .get(session_id)
            .map(|record| record.cancel_requested)
            .unwrap_or(false)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner.lock().sessions.get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<SessionRecord> {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner.sessions.values().cloned().collect();
        records.sort_by(|a, b| {
            b.updated_time
                .partial_cmp(&a.updated_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }

    /// Delete a user: force-cancel their active sessions, drop all their
    /// records, and cascade the deletion to storage. Forced-cancel
    /// markers stay until the session re-registers (stale markers are
    /// cleared by `try_register`) so post-deletion tasks still observe
    /// the cancellation.
    pub fn purge_user_sessions(&self, user_id: &str) {
        let removed: Vec<String> = {
            let mut inner = self.inner.lock();
            let ids: Vec<String> = inner
                .sessions
                .values()
                .filter(|record| record.user_id == user_id)
                .map(|record| record.session_id.clone())
                .collect();
            for session_id in &ids {
                if inner
                    .sessions
                    .get(session_id)
                    .map(|r| r.status.is_active())
                    .unwrap_or(false)
                {
                    inner.forced_cancel.insert(session_id.clone());
                }
                inner.sessions.remove(session_id);
            }
            ids
        };
        for session_id in &removed {
            if let Err(e) = self.storage.delete_monitor_record(session_id) {
                tracing::warn!(session_id, error = %e, "monitor record delete failed");
            }
        }
    }

    /// Restart recovery: load persisted records; anything non-terminal is
    /// flipped to error with a fixed summary.
    pub fn restore_from_storage(&self) {
        let records = match self.storage.load_monitor_records() {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "monitor restore failed");
                return;
            }
        };
        let mut repaired = Vec::new();
        {
            let mut inner = self.inner.lock();
            for payload in records {
                let Ok(mut record) = serde_json::from_value::<SessionRecord>(payload) else {
                    continue;
                };
                if !record.status.is_terminal() {
                    record.status = SessionStatus::Error;
                    record.summary = "service restarted".into();
                    record.stage = "error".into();
                    record.updated_time = now_ts();
                    record.ended_time = Some(record.updated_time);
                    record.events.push_back(MonitorEvent {
                        timestamp: record.updated_time,
                        event_type: EventType::Restart.as_str().to_string(),
                        data: serde_json::json!({"reason": "service restarted"}),
                    });
                    repaired.push(record.clone());
                }
                inner.sessions.insert(record.session_id.clone(), record);
            }
        }
        for record in &repaired {
            self.persist(record);
        }
        if !repaired.is_empty() {
            let _ = self.storage.write_system_log(
                "WARNING",
                "monitor",
                "service restarted with active sessions",
                Some(&serde_json::json!({
                    "repaired": repaired.iter().map(|r| r.session_id.as_str()).collect::<Vec<_>>(),
                })),
            );
        }
    }

    fn persist(&self, record: &SessionRecord) {
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "monitor record serialize failed");
                return;
            }
        };
        if let Err(e) =
            self.storage
                .upsert_monitor_record(&record.session_id, &record.user_id, &payload)
        {
            tracing::warn!(session_id = %record.session_id, error = %e, "monitor persist failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> Arc<SessionMonitor> {
        SessionMonitor::new(Storage::open_in_memory().unwrap(), ObservabilityConfig::default())
    }

    #[test]
    fn register_rejects_second_session_for_user() {
        let monitor = monitor();
        assert!(monitor.try_register("s1", "u1", "q1"));
        assert!(!monitor.try_register("s2", "u1", "q2"));
        // other users unaffected
        assert!(monitor.try_register("s3", "u2", "q3"));
        // same session re-register bumps rounds
        assert!(monitor.try_register("s1", "u1", "q1 again"));
        assert_eq!(monitor.get("s1").unwrap().rounds, 2);
    }

    #[test]
    fn register_allowed_after_terminal() {
        let monitor = monitor();
        monitor.try_register("s1", "u1", "q");
        monitor.mark_finished("s1");
        assert!(monitor.try_register("s2", "u1", "q2"));
    }

    #[test]
    fn stage_and_summary_derivation() {
        let monitor = monitor();
        monitor.try_register("s1", "u1", "q");
        monitor.record_event(
            "s1",
            EventType::ToolCall,
            &serde_json::json!({"tool": "read", "args": {}}),
        );
        let record = monitor.get("s1").unwrap();
        assert_eq!(record.stage, "tool_call");
        assert_eq!(record.summary, "call(read)");

        monitor.record_event("s1", EventType::LlmRequest, &serde_json::json!({}));
        assert_eq!(monitor.get("s1").unwrap().stage, "llm_request");

        monitor.record_event(
            "s1",
            EventType::TokenUsage,
            &serde_json::json!({"input_tokens": 10, "output_tokens": 2, "total_tokens": 12}),
        );
        assert_eq!(monitor.get("s1").unwrap().token_usage.total_tokens, 12);
    }

    #[test]
    fn event_ring_is_bounded() {
        let monitor = SessionMonitor::new(
            Storage::open_in_memory().unwrap(),
            ObservabilityConfig {
                monitor_event_limit: 3,
                ..Default::default()
            },
        );
        monitor.try_register("s1", "u1", "q");
        for i in 0..10 {
            monitor.record_event("s1", EventType::Progress, &serde_json::json!({"i": i}));
        }
        let record = monitor.get("s1").unwrap();
        assert_eq!(record.events.len(), 3);
        assert_eq!(record.events.front().unwrap().data["i"], 7);
    }

    #[test]
    fn drop_list_skips_event_but_updates_stage() {
        let monitor = SessionMonitor::new(
            Storage::open_in_memory().unwrap(),
            ObservabilityConfig {
                monitor_drop_event_types: vec!["llm_output_delta".into(), "tool_call".into()],
                ..Default::default()
            },
        );
        monitor.try_register("s1", "u1", "q");
        monitor.record_event(
            "s1",
            EventType::ToolCall,
            &serde_json::json!({"tool": "read"}),
        );
        let record = monitor.get("s1").unwrap();
        assert!(record.events.is_empty());
        assert_eq!(record.stage, "tool_call");
    }

    #[test]
    fn terminal_is_sticky_and_stops_events() {
        let monitor = monitor();
        monitor.try_register("s1", "u1", "q");
        monitor.mark_cancelled("s1");
        let ended = monitor.get("s1").unwrap().ended_time;
        assert!(ended.is_some());

        // later transitions and events are ignored
        monitor.mark_error("s1", "boom");
        monitor.record_event("s1", EventType::Progress, &serde_json::json!({}));
        let record = monitor.get("s1").unwrap();
        assert_eq!(record.status, SessionStatus::Cancelled);
        assert!(record.events.is_empty());
    }

    #[test]
    fn cancel_sets_flag_and_status() {
        let monitor = monitor();
        monitor.try_register("s1", "u1", "q");
        assert!(!monitor.is_cancelled("s1"));
        assert!(monitor.cancel("s1"));
        assert!(monitor.is_cancelled("s1"));
        assert_eq!(monitor.get("s1").unwrap().status, SessionStatus::Cancelling);
        assert!(!monitor.cancel("missing"));
    }

    #[test]
    fn purge_user_forces_cancel_and_drops_records() {
        let monitor = monitor();
        monitor.try_register("s1", "u1", "q");
        monitor.purge_user_sessions("u1");
        assert!(monitor.get("s1").is_none());
        // forced-cancel marker outlives the record
        assert!(monitor.is_cancelled("s1"));
        // a fresh register clears the stale marker
        assert!(monitor.try_register("s1", "u1", "q"));
        assert!(!monitor.is_cancelled("s1"));
    }

    #[test]
    fn restart_flips_active_records_to_error() {
        let storage = Storage::open_in_memory().unwrap();
        {
            let monitor = SessionMonitor::new(storage.clone(), ObservabilityConfig::default());
            monitor.try_register("active", "u1", "q");
            monitor.try_register("done", "u2", "q");
            monitor.mark_finished("done");
        }
        let restarted = SessionMonitor::new(storage, ObservabilityConfig::default());
        restarted.restore_from_storage();

        let active = restarted.get("active").unwrap();
        assert_eq!(active.status, SessionStatus::Error);
        assert_eq!(active.summary, "service restarted");
        assert!(active.ended_time.is_some());
        assert_eq!(active.events.back().unwrap().event_type, "restart");

        let done = restarted.get("done").unwrap();
        assert_eq!(done.status, SessionStatus::Finished);
    }

    #[test]
    fn payload_cap_truncates_large_events() {
        let monitor = SessionMonitor::new(
            Storage::open_in_memory().unwrap(),
            ObservabilityConfig {
                monitor_payload_max_chars: 50,
                ..Default::default()
            },
        );
        monitor.try_register("s1", "u1", "q");
        let big = "z".repeat(500);
        monitor.record_event("s1", EventType::Progress, &serde_json::json!({"blob": big}));
        let record = monitor.get("s1").unwrap();
        let stored = serde_json::to_string(&record.events[0].data).unwrap();
        assert!(stored.len() < 200);
    }
}
