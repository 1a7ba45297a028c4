use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Global admission cap: max concurrently active sessions across all
    /// processes sharing the lock table.
    #[serde(default = "d_4")]
    pub max_active_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: 4,
        }
    }
}

fn d_4() -> usize {
    4
}
