//! Per-session stream fabric: a bounded in-memory queue feeding the SSE
//! consumer, with overflow spill to storage and resequenced replay.
//!
//! The producer never blocks — a full queue diverts the event to the
//! durable overflow table, and the consumer interleaves overflow rows
//! back into the stream in `event_id` order, so a slow client sees every
//! event exactly once as long as overflow rows outlive the gap.

use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use relay_domain::constants::{
    STREAM_EVENT_CLEANUP_INTERVAL_S, STREAM_EVENT_FETCH_LIMIT, STREAM_EVENT_POLL_INTERVAL_S,
    STREAM_EVENT_QUEUE_SIZE, STREAM_EVENT_TTL_S,
};
use relay_domain::event::StreamEvent;
use relay_storage::{now_ts, Storage};

/// Items travelling through the bounded queue.
pub enum QueueItem {
    Event(StreamEvent),
    Done,
}

/// Throttles overflow-table GC so bursts don't sweep on every write.
struct CleanupThrottle {
    last_cleanup: Mutex<f64>,
}

impl CleanupThrottle {
    fn new() -> Self {
        Self {
            last_cleanup: Mutex::new(0.0),
        }
    }

    fn should_run(&self) -> bool {
        let now = now_ts();
        let mut last = self.last_cleanup.lock();
        if now - *last < STREAM_EVENT_CLEANUP_INTERVAL_S {
            return false;
        }
        *last = now;
        true
    }
}

/// Producer half: owned by the event emitter.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<QueueItem>,
    storage: Storage,
    session_id: String,
    user_id: String,
    cleanup: Arc<CleanupThrottle>,
}

impl StreamSender {
    /// Push an event without blocking. A full queue spills the event to
    /// the overflow table under the owner's user id.
    pub fn push(&self, event: &StreamEvent) {
        match self.tx.try_send(QueueItem::Event(event.clone())) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.spill(event);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Consumer went away; spill so a reconnect can replay.
                self.spill(event);
            }
        }
    }

    fn spill(&self, event: &StreamEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "overflow event serialize failed");
                return;
            }
        };
        if let Err(e) = self.storage.append_stream_event(
            &self.session_id,
            event.event_id,
            &self.user_id,
            &payload,
        ) {
            tracing::warn!(
                session_id = %self.session_id,
                event_id = event.event_id,
                error = %e,
                "overflow event write failed"
            );
            return;
        }
        if self.cleanup.should_run() {
            let cutoff = now_ts() - STREAM_EVENT_TTL_S;
            if let Err(e) = self.storage.delete_stream_events_before(cutoff) {
                tracing::warn!(error = %e, "overflow cleanup failed");
            }
        }
    }

    /// Push the end-of-stream sentinel. Waits for queue space — the
    /// consumer must observe it to terminate.
    pub async fn finish(&self) {
        let _ = self.tx.send(QueueItem::Done).await;
    }
}

/// Create the bounded queue for one streaming request.
pub fn channel(
    storage: Storage,
    session_id: &str,
    user_id: &str,
) -> (StreamSender, mpsc::Receiver<QueueItem>) {
    let (tx, rx) = mpsc::channel(STREAM_EVENT_QUEUE_SIZE);
    (
        StreamSender {
            tx,
            storage,
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            cleanup: Arc::new(CleanupThrottle::new()),
        },
        rx,
    )
}

async fn load_overflow(
    storage: &Storage,
    session_id: &str,
    after: u64,
    limit: usize,
) -> Vec<StreamEvent> {
    let storage = storage.clone();
    let session = session_id.to_string();
    let rows = tokio::task::spawn_blocking(move || storage.load_stream_events(&session, after, limit))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "overflow load task failed");
            Ok(Vec::new())
        })
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "overflow load failed");
            Vec::new()
        });
    rows.into_iter()
        .filter_map(|(event_id, payload)| {
            let mut event = serde_json::from_value::<StreamEvent>(payload).ok()?;
            event.event_id = event_id;
            Some(event)
        })
        .collect()
}

/// Consume the queue into a totally-ordered event stream.
///
/// Delivery rules:
/// 1. A queued event with a gap ahead of it first drains overflow rows in
///    `(last_event_id, event.event_id)`.
/// 2. Idle poll ticks scan the overflow table for rows past the cursor.
/// 3. After the `Done` sentinel, one final drain closes the stream.
pub fn consume(
    mut rx: mpsc::Receiver<QueueItem>,
    storage: Storage,
    session_id: String,
) -> impl Stream<Item = StreamEvent> {
    async_stream::stream! {
        let poll_interval = Duration::from_secs_f64(STREAM_EVENT_POLL_INTERVAL_S);
        let mut last_event_id: u64 = 0;
        loop {
            match tokio::time::timeout(poll_interval, rx.recv()).await {
                Ok(Some(QueueItem::Event(event))) => {
                    if event.event_id > last_event_id + 1 {
                        // Close the gap from overflow before yielding.
                        loop {
                            let rows = load_overflow(
                                &storage,
                                &session_id,
                                last_event_id,
                                STREAM_EVENT_FETCH_LIMIT,
                            )
                            .await;
                            let mut progressed = false;
                            for row in rows {
                                if row.event_id <= last_event_id
                                    || row.event_id >= event.event_id
                                {
                                    continue;
                                }
                                last_event_id = row.event_id;
                                progressed = true;
                                yield row;
                            }
                            if !progressed || last_event_id + 1 >= event.event_id {
                                break;
                            }
                        }
                    }
                    if event.event_id <= last_event_id {
                        continue;
                    }
                    last_event_id = event.event_id;
                    yield event;
                }
                Ok(Some(QueueItem::Done)) | Ok(None) => {
                    // Final drain, then close.
                    loop {
                        let rows = load_overflow(
                            &storage,
                            &session_id,
                            last_event_id,
                            STREAM_EVENT_FETCH_LIMIT,
                        )
                        .await;
                        if rows.is_empty() {
                            break;
                        }
                        for row in rows {
                            if row.event_id <= last_event_id {
                                continue;
                            }
                            last_event_id = row.event_id;
                            yield row;
                        }
                    }
                    break;
                }
                Err(_) => {
                    // Poll tick: deliver anything that spilled past us.
                    let rows = load_overflow(
                        &storage,
                        &session_id,
                        last_event_id,
                        STREAM_EVENT_FETCH_LIMIT,
                    )
                    .await;
                    for row in rows {
                        if row.event_id <= last_event_id {
                            continue;
                        }
                        last_event_id = row.event_id;
                        yield row;
                    }
                }
            }
        }
    }
}
