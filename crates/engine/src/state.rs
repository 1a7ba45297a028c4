//! Shared engine state — every service the request runtime needs, wired
//! once at startup and handed around by cheap clone.
//!
//! Cyclic references are avoided by constructor injection: the monitor,
//! limiter, workspace, composer, and memory service are all built here
//! and only ever reached through this struct or a request-scoped context.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use relay_domain::config::RelayConfig;
use relay_providers::LlmClient;
use relay_skills::SkillRegistry;
use relay_storage::Storage;

use crate::prompts::PromptTemplates;
use crate::runtime::limiter::RequestLimiter;
use crate::runtime::memory::MemoryService;
use crate::runtime::monitor::SessionMonitor;
use crate::runtime::prompt::PromptComposer;
use crate::runtime::tools::{ExecutorSet, UserToolBinding};
use crate::workspace::WorkspaceManager;

#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<RwLock<Arc<RelayConfig>>>,
    pub config_version: Arc<AtomicU64>,
    pub storage: Storage,
    pub workspace: Arc<WorkspaceManager>,
    pub monitor: Arc<SessionMonitor>,
    pub limiter: Arc<RequestLimiter>,
    pub skills: Arc<RwLock<Arc<SkillRegistry>>>,
    pub templates: Arc<PromptTemplates>,
    pub composer: Arc<PromptComposer>,
    pub llm: Arc<dyn LlmClient>,
    pub executors: Arc<ExecutorSet>,
    pub memory: Arc<MemoryService>,
    /// User-tool alias bindings, keyed by alias name.
    pub user_tools: Arc<RwLock<HashMap<String, UserToolBinding>>>,
    pub user_tool_version: Arc<AtomicU64>,
    pub shared_tool_version: Arc<AtomicU64>,
}

impl EngineState {
    /// Wire the engine over an opened storage gateway, an LLM client, and
    /// the executor capabilities. Restores monitor records (restart
    /// recovery happens here).
    pub fn new(
        config: RelayConfig,
        storage: Storage,
        llm: Arc<dyn LlmClient>,
        executors: Arc<ExecutorSet>,
        templates_dir: impl Into<PathBuf>,
    ) -> Self {
        let workspace = WorkspaceManager::new(config.workspace.root.clone(), storage.clone());
        let monitor = SessionMonitor::new(storage.clone(), config.observability.clone());
        monitor.restore_from_storage();
        let limiter = RequestLimiter::new(storage.clone(), config.server.max_active_sessions);
        let skills = Arc::new(SkillRegistry::load(
            &config.skills.paths,
            &config.skills.enabled,
        ));
        let templates = Arc::new(PromptTemplates::new(templates_dir));
        let composer = Arc::new(PromptComposer::new(Arc::clone(&templates)));
        let config = Arc::new(RwLock::new(Arc::new(config)));
        let memory = MemoryService::new(
            storage.clone(),
            Arc::clone(&workspace),
            Arc::clone(&llm),
            Arc::clone(&templates),
            Arc::clone(&config),
        );

        Self {
            config,
            config_version: Arc::new(AtomicU64::new(1)),
            storage,
            workspace,
            monitor,
            limiter,
            skills: Arc::new(RwLock::new(skills)),
            templates,
            composer,
            llm,
            executors,
            memory,
            user_tools: Arc::new(RwLock::new(HashMap::new())),
            user_tool_version: Arc::new(AtomicU64::new(0)),
            shared_tool_version: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Swap in a new configuration: bumps the config version (which
    /// invalidates the prompt cache), resizes admission, re-scans skills,
    /// and updates monitor limits.
    pub fn apply_config(&self, config: RelayConfig) {
        self.limiter.set_max_active(config.server.max_active_sessions);
        self.monitor.set_observability(config.observability.clone());
        *self.skills.write() = Arc::new(SkillRegistry::load(
            &config.skills.paths,
            &config.skills.enabled,
        ));
        *self.config.write() = Arc::new(config);
        self.config_version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current_config(&self) -> Arc<RelayConfig> {
        self.config.read().clone()
    }

    pub fn current_skills(&self) -> Arc<SkillRegistry> {
        self.skills.read().clone()
    }

    /// Replace the user-tool alias bindings (admin surface).
    pub fn set_user_tools(&self, bindings: HashMap<String, UserToolBinding>) {
        *self.user_tools.write() = bindings;
        self.user_tool_version.fetch_add(1, Ordering::SeqCst);
    }

    /// Delete a user across the engine: cancel and drop their sessions,
    /// then purge every table they touch.
    pub async fn purge_user(&self, user_id: &str) -> relay_domain::Result<()> {
        self.monitor.purge_user_sessions(user_id);
        self.workspace.purge_user(user_id).await
    }

    /// Drop rows older than the configured retention window across the
    /// log-like tables. Meant for a periodic maintenance task.
    pub async fn run_retention_sweep(
        &self,
    ) -> relay_domain::Result<std::collections::HashMap<&'static str, usize>> {
        let retention_days = self.current_config().workspace.retention_days;
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || storage.cleanup_retention(retention_days))
            .await
            .map_err(|e| relay_domain::Error::Internal(format!("retention task: {e}")))?
    }
}
