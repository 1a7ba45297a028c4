//! Per-session event factory.
//!
//! Stamps each event with the next monotonic `event_id`, records it with
//! the monitor, and forwards it to the stream bus when the request is
//! streaming. `emit` is sync and thread-safe, so tool callbacks running
//! on worker threads can publish without touching the async runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relay_domain::event::{EventType, StreamEvent};

use super::monitor::SessionMonitor;
use super::stream_bus::StreamSender;

pub struct EventEmitter {
    session_id: String,
    seq: AtomicU64,
    monitor: Arc<SessionMonitor>,
    sender: Option<StreamSender>,
}

impl EventEmitter {
    pub fn new(
        session_id: impl Into<String>,
        monitor: Arc<SessionMonitor>,
        sender: Option<StreamSender>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            seq: AtomicU64::new(0),
            monitor,
            sender,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Build, stamp, and publish an event. Returns the stamped event.
    pub fn emit(&self, event_type: EventType, data: serde_json::Value) -> StreamEvent {
        let mut event = StreamEvent::new(event_type, self.session_id.clone(), data);
        event.event_id = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.publish(&event);
        event
    }

    /// Publish an already-stamped event (tool debug events that were
    /// produced off-loop keep their original ids).
    pub fn emit_event(&self, event: &StreamEvent) {
        self.publish(event);
    }

    fn publish(&self, event: &StreamEvent) {
        self.monitor
            .record_event(&self.session_id, event.event_type, &event.data);
        if let Some(sender) = &self.sender {
            sender.push(event);
        }
    }

    /// Close the stream: pushes the queue sentinel. No-op for unary
    /// requests.
    pub async fn finish(&self) {
        if let Some(sender) = &self.sender {
            sender.finish().await;
        }
    }
}
