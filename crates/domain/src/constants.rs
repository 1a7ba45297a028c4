//! Engine-wide constants. These values fix the runtime contract; changing
//! one changes observable behavior (compaction boundaries, lock lifetimes,
//! replay windows), so they live in one place.

/// Prefix for tool observations injected back into the model context.
pub const OBSERVATION_PREFIX: &str = "tool_response: ";

/// Marker prefix for persisted compaction summaries.
pub const COMPACTION_SUMMARY_PREFIX: &str = "[context summary]";

/// Marker prefix for the synthesized artifact index block.
pub const ARTIFACT_INDEX_PREFIX: &str = "[artifact index]";

/// `meta.type` value identifying a compaction-summary chat row.
pub const COMPACTION_META_TYPE: &str = "compaction_summary";

/// `meta.type` value identifying a persisted session system prompt row.
pub const SYSTEM_PROMPT_META_TYPE: &str = "system_prompt";

// ── Session locks ──────────────────────────────────────────────────

/// Lock row lifetime; the heartbeat renews well inside this window.
pub const SESSION_LOCK_TTL_S: f64 = 120.0;
/// Heartbeat renewal period. Must stay ≤ half the TTL.
pub const SESSION_LOCK_HEARTBEAT_S: f64 = 5.0;
/// Poll period while waiting on the global admission cap.
pub const SESSION_LOCK_POLL_INTERVAL_S: f64 = 0.2;

// ── Stream event bus ───────────────────────────────────────────────

/// Bounded per-session SSE queue capacity.
pub const STREAM_EVENT_QUEUE_SIZE: usize = 256;
/// Poll period for the consumer's overflow-table scans.
pub const STREAM_EVENT_POLL_INTERVAL_S: f64 = 0.2;
/// Max overflow rows fetched per replay batch.
pub const STREAM_EVENT_FETCH_LIMIT: usize = 200;
/// Overflow row retention.
pub const STREAM_EVENT_TTL_S: f64 = 3600.0;
/// Throttle between overflow-table cleanup sweeps.
pub const STREAM_EVENT_CLEANUP_INTERVAL_S: f64 = 60.0;

// ── Compaction ─────────────────────────────────────────────────────

/// Fraction of `max_context` at which the absolute-overflow trigger fires.
pub const COMPACTION_RATIO: f64 = 0.9;
/// Fraction of `max_context` at which the cumulative-history trigger fires.
pub const COMPACTION_HISTORY_RATIO: f64 = 0.8;
/// Output tokens reserved for the model reply when sizing the limit.
pub const COMPACTION_OUTPUT_RESERVE: u64 = 1024;
/// Structural slack reserved for the system prompt and framing.
pub const COMPACTION_SAFETY_MARGIN: u64 = 512;
/// Tail block kept verbatim when it fits this budget.
pub const COMPACTION_KEEP_RECENT_TOKENS: u64 = 2000;
/// Floor for shrinking individual observation messages.
pub const COMPACTION_MIN_OBSERVATION_TOKENS: u64 = 128;
/// Output budget for the summary LLM call.
pub const COMPACTION_SUMMARY_MAX_OUTPUT: u64 = 1024;
/// Per-message cap inside the summarize prompt.
pub const COMPACTION_SUMMARY_MESSAGE_MAX_TOKENS: u64 = 2048;

// ── Artifact index ─────────────────────────────────────────────────

/// Max artifact log rows consulted when synthesizing the index.
pub const ARTIFACT_INDEX_MAX_ITEMS: usize = 200;
/// Items shown per index category before the "…and N" suffix.
pub const ARTIFACT_INDEX_LIST_LIMIT: usize = 12;

// ── Monitor ────────────────────────────────────────────────────────

/// Ring capacity for per-session monitor events.
pub const MONITOR_EVENT_LIMIT: usize = 500;
/// Size cap applied to monitored event payloads.
pub const MONITOR_PAYLOAD_MAX_CHARS: usize = 4000;

// ── Memory ─────────────────────────────────────────────────────────

/// Per-user cap on long-term memory records; LRU-evicted beyond this.
pub const MAX_MEMORY_RECORDS: usize = 30;

// ── Sentinel tools ─────────────────────────────────────────────────

/// Tool name that carries the final answer.
pub const FINAL_RESPONSE_TOOL: &str = "final_response";
/// Tool name that returns structured UI messages instead of text.
pub const A2UI_TOOL: &str = "a2ui";

/// Built-in tool names whose results feed the artifact log.
pub const ARTIFACT_TOOLS: [&str; 6] = ["read", "write", "replace", "edit", "execute", "ptc"];

/// Built-in tools eligible for sandbox delegation when `sandbox.mode`
/// is `sandbox`.
pub const SANDBOX_TOOLS: [&str; 2] = ["execute", "ptc"];
