//! Per-user workspace facade.
//!
//! Owns the workspace directory layout (one subdirectory per user) and
//! fronts the storage gateway for chat/tool/artifact persistence. The
//! engine never mutates workspace files itself — tools do — but it reads
//! the directory tree for prompt assembly and tracks a tree version so
//! the prompt cache can invalidate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use relay_domain::chat::{ArtifactRecord, ChatRecord, ToolLogRecord};
use relay_domain::constants::SYSTEM_PROMPT_META_TYPE;
use relay_domain::{Error, Result};
use relay_storage::{now_ts, Storage};

/// Directory depth rendered into the engineer-info prompt block.
const TREE_MAX_DEPTH: usize = 2;
/// Entries listed per directory level before eliding.
const TREE_MAX_ENTRIES: usize = 50;

pub struct WorkspaceManager {
    root: PathBuf,
    storage: Storage,
    tree_versions: Mutex<HashMap<String, u64>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, storage: Storage) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            storage,
            tree_versions: Mutex::new(HashMap::new()),
        })
    }

    /// The workspace directory for a user. User ids are path components;
    /// anything that would escape the root is flattened.
    pub fn workspace_root(&self, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    pub fn ensure_workspace(&self, user_id: &str) -> Result<PathBuf> {
        let path = self.workspace_root(user_id);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    // ── Tree version ───────────────────────────────────────────────

    pub fn get_tree_version(&self, user_id: &str) -> u64 {
        *self.tree_versions.lock().entry(user_id.to_string()).or_insert(0)
    }

    /// Called by tool executors after any filesystem mutation so the
    /// prompt cache picks up the new tree.
    pub fn mark_tree_dirty(&self, user_id: &str) {
        *self.tree_versions.lock().entry(user_id.to_string()).or_insert(0) += 1;
    }

    /// A two-level directory listing for the engineer-info block.
    pub fn get_workspace_tree(&self, user_id: &str) -> String {
        let root = self.workspace_root(user_id);
        let mut lines = Vec::new();
        render_tree(&root, 0, &mut lines);
        lines.join("\n")
    }

    // ── Chat history ───────────────────────────────────────────────

    pub async fn load_history(
        &self,
        user_id: &str,
        session_id: &str,
        max_items: usize,
    ) -> Result<Vec<ChatRecord>> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        let session = session_id.to_string();
        run_blocking(move || storage.load_chat_history(&user, &session, Some(max_items))).await
    }

    pub async fn append_chat(&self, user_id: &str, record: ChatRecord) -> Result<()> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        run_blocking(move || storage.append_chat(&user, &record)).await
    }

    pub async fn append_tool_log(&self, user_id: &str, record: ToolLogRecord) -> Result<()> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        run_blocking(move || storage.append_tool_log(&user, &record)).await
    }

    pub async fn append_artifact_log(
        &self,
        user_id: &str,
        record: ArtifactRecord,
    ) -> Result<()> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        run_blocking(move || storage.append_artifact_log(&user, &record)).await
    }

    pub async fn load_artifact_logs(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ArtifactRecord>> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        let session = session_id.to_string();
        run_blocking(move || storage.load_artifact_logs(&user, &session, limit)).await
    }

    // ── Session token usage (meta counter) ─────────────────────────

    fn usage_key(user_id: &str, session_id: &str) -> String {
        format!("session_token_usage:{user_id}:{session_id}")
    }

    pub async fn load_session_token_usage(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<u64> {
        let storage = self.storage.clone();
        let key = Self::usage_key(user_id, session_id);
        let raw = run_blocking(move || storage.get_meta(&key)).await?;
        Ok(raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
    }

    pub async fn save_session_token_usage(
        &self,
        user_id: &str,
        session_id: &str,
        tokens: u64,
    ) -> Result<()> {
        let storage = self.storage.clone();
        let key = Self::usage_key(user_id, session_id);
        run_blocking(move || storage.set_meta(&key, &tokens.to_string())).await
    }

    /// Atomic add; returns the counter after the increment.
    pub async fn add_session_token_usage(
        &self,
        user_id: &str,
        session_id: &str,
        delta: u64,
    ) -> Result<u64> {
        let storage = self.storage.clone();
        let key = Self::usage_key(user_id, session_id);
        let value = run_blocking(move || storage.incr_meta(&key, delta as i64)).await?;
        Ok(value.max(0) as u64)
    }

    // ── Session system prompt ──────────────────────────────────────

    pub async fn load_session_system_prompt(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        let session = session_id.to_string();
        let record =
            run_blocking(move || storage.load_session_system_prompt(&user, &session)).await?;
        Ok(record.and_then(|r| r.content.as_str().map(str::to_string)))
    }

    pub async fn save_session_system_prompt(
        &self,
        user_id: &str,
        session_id: &str,
        prompt: &str,
        language: Option<&str>,
    ) -> Result<()> {
        let mut meta = serde_json::json!({"type": SYSTEM_PROMPT_META_TYPE});
        if let Some(language) = language {
            meta["language"] = serde_json::Value::String(language.to_string());
        }
        let record = ChatRecord {
            role: "system".into(),
            content: serde_json::Value::String(prompt.to_string()),
            session_id: session_id.to_string(),
            timestamp: now_ts(),
            meta: Some(meta),
            reasoning_content: None,
        };
        self.append_chat(user_id, record).await
    }

    /// Cascade a user deletion: every table the user touches.
    pub async fn purge_user(&self, user_id: &str) -> Result<()> {
        let storage = self.storage.clone();
        let user = user_id.to_string();
        run_blocking(move || {
            storage.delete_chat_history_by_user(&user)?;
            storage.delete_tool_logs_by_user(&user)?;
            storage.delete_artifact_logs_by_user(&user)?;
            storage.delete_monitor_records_by_user(&user)?;
            storage.delete_stream_events_by_user(&user)?;
            storage.delete_session_locks_by_user(&user)?;
            storage.delete_memory_records_by_user(&user)?;
            storage.delete_memory_task_logs_by_user(&user)?;
            storage.delete_memory_settings_by_user(&user)?;
            storage.delete_meta_prefix(&format!("session_token_usage:{user}:"))?;
            Ok(())
        })
        .await
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("storage task: {e}")))?
}

fn render_tree(dir: &Path, depth: usize, lines: &mut Vec<String>) {
    if depth >= TREE_MAX_DEPTH {
        return;
    }
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = read_dir.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    let total = entries.len();
    for entry in entries.into_iter().take(TREE_MAX_ENTRIES) {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let indent = "  ".repeat(depth);
        if is_dir {
            lines.push(format!("{indent}{name}/"));
            render_tree(&entry.path(), depth + 1, lines);
        } else {
            lines.push(format!("{indent}{name}"));
        }
    }
    if total > TREE_MAX_ENTRIES {
        let indent = "  ".repeat(depth);
        lines.push(format!("{indent}… {} more entries", total - TREE_MAX_ENTRIES));
    }
}
