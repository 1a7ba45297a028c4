//! Tool name resolution and dispatch.
//!
//! The dispatcher resolves a model-emitted tool name to a typed executor
//! variant (built-in, skill, MCP, A2A, sandbox, user alias) once, then
//! executes through the matching client shim. Every dispatch emits a
//! `tool_call`/`tool_result` pair — including denials, so the model
//! always sees an observation for what it asked.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_domain::chat::{ToolCall, ToolOutcome, ToolSpec};
use relay_domain::config::{SandboxMode, SecurityConfig};
use relay_domain::constants::{
    A2UI_TOOL, FINAL_RESPONSE_TOOL, SANDBOX_TOOLS, SESSION_LOCK_POLL_INTERVAL_S,
};
use relay_domain::event::EventType;
use relay_domain::{Error, Result};
use relay_skills::SkillRegistry;

use super::emitter::EventEmitter;
use super::monitor::SessionMonitor;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor shims (external capabilities)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Request-scoped context handed to executors.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub user_id: String,
    pub session_id: String,
    pub workspace_root: PathBuf,
    pub security: SecurityConfig,
}

/// Built-in tool registry: the engine knows names, schemas, and the
/// uniform result shape; the bodies live outside the core.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    fn specs(&self) -> Vec<ToolSpec>;
    async fn execute(&self, name: &str, args: &serde_json::Value, ctx: &ToolContext)
        -> ToolOutcome;
}

#[async_trait::async_trait]
pub trait McpClient: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> ToolOutcome;
}

#[async_trait::async_trait]
pub trait A2aClient: Send + Sync {
    async fn call(&self, service: &str, args: &serde_json::Value) -> ToolOutcome;
}

#[async_trait::async_trait]
pub trait SandboxClient: Send + Sync {
    async fn execute(
        &self,
        tool: &str,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolOutcome;

    /// Best-effort release of a per-session sandbox.
    async fn release(&self, user_id: &str, session_id: &str);
}

#[async_trait::async_trait]
pub trait KnowledgeClient: Send + Sync {
    async fn query(&self, base: &str, args: &serde_json::Value) -> ToolOutcome;
}

/// The full set of executor capabilities wired at engine construction.
#[derive(Clone)]
pub struct ExecutorSet {
    pub builtin: Arc<dyn ToolExecutor>,
    pub mcp: Option<Arc<dyn McpClient>>,
    pub a2a: Option<Arc<dyn A2aClient>>,
    pub sandbox: Option<Arc<dyn SandboxClient>>,
    pub knowledge: Option<Arc<dyn KnowledgeClient>>,
}

/// A user-tool binding: an alias the user created over a skill, a
/// knowledge base, or an MCP tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserToolBinding {
    pub kind: AliasKind,
    /// Skill name, knowledge base name, or `server@tool`.
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasKind {
    Skill,
    Knowledge,
    Mcp,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a tool name dispatches to. Resolution order is fixed; first
/// match wins.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedExecutor {
    /// `final_response` / `a2ui` — handled by the loop, never dispatched.
    Sentinel,
    UserAlias(UserToolBinding),
    Skill(String),
    Mcp { server: String, tool: String },
    A2a { service: String },
    SandboxBuiltin(String),
    Builtin(String),
    Unknown,
}

pub struct ToolDispatcher {
    executors: Arc<ExecutorSet>,
    skills: Arc<SkillRegistry>,
    user_aliases: HashMap<String, UserToolBinding>,
    allowed: HashSet<String>,
    /// When the request asked for "all tools", remote (`server@tool`,
    /// `a2a@service`) names pass the allow check without enumeration.
    allow_remote: bool,
    builtin_names: HashSet<String>,
    sandbox_enabled: bool,
    emitter: Arc<EventEmitter>,
    monitor: Arc<SessionMonitor>,
    ctx: ToolContext,
}

impl ToolDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executors: Arc<ExecutorSet>,
        skills: Arc<SkillRegistry>,
        user_aliases: HashMap<String, UserToolBinding>,
        allowed: HashSet<String>,
        allow_remote: bool,
        sandbox_mode: SandboxMode,
        emitter: Arc<EventEmitter>,
        monitor: Arc<SessionMonitor>,
        ctx: ToolContext,
    ) -> Self {
        let builtin_names = executors
            .builtin
            .specs()
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        Self {
            executors,
            skills,
            user_aliases,
            allowed,
            allow_remote,
            builtin_names,
            sandbox_enabled: sandbox_mode == SandboxMode::Sandbox,
            emitter,
            monitor,
            ctx,
        }
    }

    /// Resolve a name to its executor variant.
    pub fn resolve(&self, name: &str) -> ResolvedExecutor {
        if name == FINAL_RESPONSE_TOOL || name == A2UI_TOOL {
            return ResolvedExecutor::Sentinel;
        }
        if let Some(binding) = self.user_aliases.get(name) {
            return ResolvedExecutor::UserAlias(binding.clone());
        }
        if self.skills.contains(name) {
            return ResolvedExecutor::Skill(name.to_string());
        }
        if let Some(service) = name.strip_prefix("a2a@") {
            return ResolvedExecutor::A2a {
                service: service.to_string(),
            };
        }
        if let Some((server, tool)) = name.split_once('@') {
            return ResolvedExecutor::Mcp {
                server: server.to_string(),
                tool: tool.to_string(),
            };
        }
        if self.is_sandbox_tool(name) {
            return ResolvedExecutor::SandboxBuiltin(name.to_string());
        }
        if self.builtin_names.contains(name) {
            return ResolvedExecutor::Builtin(name.to_string());
        }
        ResolvedExecutor::Unknown
    }

    pub fn is_sandbox_tool(&self, name: &str) -> bool {
        self.sandbox_enabled && SANDBOX_TOOLS.contains(&name)
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.allowed.contains(name) || (self.allow_remote && name.contains('@'))
    }

    /// Dispatch one call: emit `tool_call`, execute (or deny), emit
    /// `tool_result`. Cancellation interrupts the executor via a sibling
    /// poll on the monitor flag.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolOutcome> {
        let safe_args = safe_args(&call.arguments);
        self.emitter.emit(
            EventType::ToolCall,
            serde_json::json!({"tool": call.name, "args": safe_args}),
        );

        let outcome = if !self.is_allowed(&call.name) {
            ToolOutcome::error("tool disabled or unavailable")
        } else {
            self.execute_resolved(&call.name, &safe_args).await?
        };

        let mut outcome = outcome;
        if self.is_sandbox_tool(&call.name) {
            outcome.sandbox = Some(true);
        }

        let mut payload = serde_json::json!({
            "tool": call.name,
            "ok": outcome.ok,
            "data": outcome.data,
        });
        if let Some(error) = &outcome.error {
            payload["error"] = serde_json::Value::String(error.clone());
        }
        if outcome.sandbox == Some(true) {
            payload["sandbox"] = serde_json::Value::Bool(true);
        }
        self.emitter.emit(EventType::ToolResult, payload);
        Ok(outcome)
    }

    async fn execute_resolved(
        &self,
        name: &str,
        args: &serde_json::Value,
    ) -> Result<ToolOutcome> {
        let resolved = self.resolve(name);
        let future = self.run_executor(resolved, name, args);
        tokio::pin!(future);

        // Sibling poller: a cancel request interrupts the in-flight tool.
        let poll = Duration::from_secs_f64(SESSION_LOCK_POLL_INTERVAL_S);
        loop {
            tokio::select! {
                outcome = &mut future => return Ok(outcome),
                _ = tokio::time::sleep(poll) => {
                    if self.monitor.is_cancelled(&self.ctx.session_id) {
                        return Err(Error::Cancelled);
                    }
                }
            }
        }
    }

    async fn run_executor(
        &self,
        resolved: ResolvedExecutor,
        name: &str,
        args: &serde_json::Value,
    ) -> ToolOutcome {
        match resolved {
            ResolvedExecutor::Sentinel => {
                ToolOutcome::error("sentinel tools are handled by the loop")
            }
            ResolvedExecutor::UserAlias(binding) => self.run_alias(&binding, args).await,
            ResolvedExecutor::Skill(skill_name) => self.run_skill(&skill_name),
            ResolvedExecutor::Mcp { server, tool } => match &self.executors.mcp {
                Some(mcp) => mcp.call_tool(&server, &tool, args).await,
                None => ToolOutcome::error("MCP is not configured"),
            },
            ResolvedExecutor::A2a { service } => match &self.executors.a2a {
                Some(a2a) => a2a.call(&service, args).await,
                None => ToolOutcome::error("A2A is not configured"),
            },
            ResolvedExecutor::SandboxBuiltin(tool) => match &self.executors.sandbox {
                Some(sandbox) => sandbox.execute(&tool, args, &self.ctx).await,
                None => ToolOutcome::error("sandbox is not configured"),
            },
            ResolvedExecutor::Builtin(tool) => {
                self.executors.builtin.execute(&tool, args, &self.ctx).await
            }
            ResolvedExecutor::Unknown => {
                ToolOutcome::error(format!("tool not found: {name}"))
            }
        }
    }

    async fn run_alias(&self, binding: &UserToolBinding, args: &serde_json::Value) -> ToolOutcome {
        match binding.kind {
            AliasKind::Skill => self.run_skill(&binding.target),
            AliasKind::Knowledge => match &self.executors.knowledge {
                Some(knowledge) => knowledge.query(&binding.target, args).await,
                None => ToolOutcome::error("knowledge is not configured"),
            },
            AliasKind::Mcp => match binding.target.split_once('@') {
                Some((server, tool)) => match &self.executors.mcp {
                    Some(mcp) => mcp.call_tool(server, tool, args).await,
                    None => ToolOutcome::error("MCP is not configured"),
                },
                None => ToolOutcome::error(format!("bad MCP alias target: {}", binding.target)),
            },
        }
    }

    /// Executing a skill surfaces its document; the model carries out the
    /// instructions itself.
    fn run_skill(&self, skill_name: &str) -> ToolOutcome {
        let Some(spec) = self.skills.resolve(skill_name) else {
            return ToolOutcome::error(format!("skill not found: {skill_name}"));
        };
        match spec.read_document() {
            Ok(content) => ToolOutcome::ok(serde_json::json!({
                "skill": spec.name,
                "path": spec.path.display().to_string(),
                "content": content,
            })),
            Err(e) => ToolOutcome::error(format!("skill read failed: {e}")),
        }
    }

    /// Best-effort sandbox release after a sandbox-eligible tool ran.
    pub async fn release_sandbox_if_needed(&self, name: &str) {
        if !self.is_sandbox_tool(name) {
            return;
        }
        if let Some(sandbox) = &self.executors.sandbox {
            sandbox
                .release(&self.ctx.user_id, &self.ctx.session_id)
                .await;
        }
    }
}

/// Arguments as an object; anything else is wrapped as `{raw: …}`.
fn safe_args(args: &serde_json::Value) -> serde_json::Value {
    if args.is_object() {
        args.clone()
    } else {
        serde_json::json!({ "raw": args })
    }
}
