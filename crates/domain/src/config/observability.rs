use serde::{Deserialize, Serialize};

use crate::constants::{MONITOR_EVENT_LIMIT, MONITOR_PAYLOAD_MAX_CHARS};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Per-session monitor event ring capacity.
    #[serde(default = "d_event_limit")]
    pub monitor_event_limit: usize,
    /// Size cap applied to monitored payloads.
    #[serde(default = "d_payload_max")]
    pub monitor_payload_max_chars: usize,
    /// Event types the monitor drops entirely (e.g. `llm_output_delta`).
    #[serde(default)]
    pub monitor_drop_event_types: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            monitor_event_limit: d_event_limit(),
            monitor_payload_max_chars: d_payload_max(),
            monitor_drop_event_types: Vec::new(),
        }
    }
}

fn d_event_limit() -> usize {
    MONITOR_EVENT_LIMIT
}
fn d_payload_max() -> usize {
    MONITOR_PAYLOAD_MAX_CHARS
}
