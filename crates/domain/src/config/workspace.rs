use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory holding one subdirectory per user.
    #[serde(default = "d_root")]
    pub root: PathBuf,
    /// Tail window of chat rows loaded when building context.
    #[serde(default = "d_history_items")]
    pub max_history_items: usize,
    /// Rows older than this are removed by the retention sweep.
    #[serde(default = "d_retention")]
    pub retention_days: u32,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: d_root(),
            max_history_items: d_history_items(),
            retention_days: d_retention(),
        }
    }
}

fn d_root() -> PathBuf {
    PathBuf::from("./workspaces")
}
fn d_history_items() -> usize {
    200
}
fn d_retention() -> u32 {
    30
}
