//! Tool registry: the catalogue of callable capabilities for one turn.
//!
//! The pool assembles a fresh registry per invocation and applies the
//! optional middlewares (`with_env`, `with_subagent_manager`,
//! `with_parent_session`, `with_memory_search`, `with_browser`, ...) before
//! handing it to the runner. Dispatch is uniform: every outcome becomes a
//! tool-result body, with `is_error` marking failures so the model can
//! self-correct.

mod agent_tools;
#[cfg(feature = "browser")]
pub mod browser;
mod edit_file;
mod exec;
mod memory_search;
mod read_file;
mod search;
mod self_manage;
mod web_fetch;
mod write_file;

pub use agent_tools::ReportToParentTool;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::broadcast::Broadcasters;
use crate::llm::embed::Embedder;
use crate::llm::ToolDef;
use crate::memory::MemoryTree;
use crate::subagent;

/// Callback for the self_set_env / self_delete_env tools. `None` value means
/// remove.
pub type EnvUpdater = Arc<dyn Fn(&str, Option<&str>) -> anyhow::Result<()> + Send + Sync>;

/// Callback for self_rename.
pub type AgentRenamer = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

/// A callable tool. Handlers receive the raw JSON input string; both a
/// non-empty output and an error can be significant at once — see
/// [`PartialOutput`].
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema for the tool input.
    fn schema(&self) -> Value;
    async fn call(&self, cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String>;
}

/// An error that still produced useful output (stderr alongside an exit
/// status, a partial download). The registry combines both into one
/// tool-result body so the model sees everything.
#[derive(Debug)]
pub struct PartialOutput {
    pub output: String,
    pub message: String,
}

impl std::fmt::Display for PartialOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PartialOutput {}

/// Outcome of one dispatch: the tool-result body plus the error flag.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub body: String,
    pub is_error: bool,
}

pub struct Registry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    workspace_dir: PathBuf,
    agent_id: String,
}

impl Registry {
    /// Build a registry with the unconditional built-ins. Inter-agent and
    /// self-management tools are always present; without their backing
    /// collaborators they answer with a clear "not configured" error, never
    /// "unknown tool".
    pub fn new(workspace_dir: impl Into<PathBuf>, agent_id: &str) -> Self {
        let workspace_dir = workspace_dir.into();
        let mut reg = Self {
            tools: BTreeMap::new(),
            workspace_dir: workspace_dir.clone(),
            agent_id: agent_id.to_string(),
        };
        reg.register(Arc::new(read_file::ReadTool::new(&workspace_dir)));
        reg.register(Arc::new(write_file::WriteTool::new(&workspace_dir)));
        reg.register(Arc::new(edit_file::EditTool::new(&workspace_dir)));
        reg.register(Arc::new(search::GrepTool::new(&workspace_dir)));
        reg.register(Arc::new(search::GlobTool::new(&workspace_dir)));
        reg.register(Arc::new(exec::ExecTool::new(&workspace_dir, HashMap::new())));
        reg.register(Arc::new(web_fetch::WebFetchTool::new()));
        reg.register(Arc::new(self_manage::SelfRenameTool::new(None)));
        reg.register(Arc::new(self_manage::SelfInstallSkillTool::new(&workspace_dir)));
        reg.register(Arc::new(self_manage::SelfUninstallSkillTool::new(&workspace_dir)));
        reg.register(Arc::new(self_manage::SelfListSkillsTool::new(&workspace_dir)));
        reg.register(Arc::new(self_manage::SelfSetEnvTool::new(None)));
        reg.register(Arc::new(self_manage::SelfDeleteEnvTool::new(None)));
        for tool in agent_tools::unconfigured(agent_id) {
            reg.register(tool);
        }
        reg
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Per-agent env vars flow into shell execution.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.register(Arc::new(exec::ExecTool::new(&self.workspace_dir, env)));
        self
    }

    pub fn with_env_updater(mut self, updater: EnvUpdater) -> Self {
        self.register(Arc::new(self_manage::SelfSetEnvTool::new(Some(
            updater.clone(),
        ))));
        self.register(Arc::new(self_manage::SelfDeleteEnvTool::new(Some(updater))));
        self
    }

    pub fn with_agent_renamer(mut self, renamer: AgentRenamer) -> Self {
        self.register(Arc::new(self_manage::SelfRenameTool::new(Some(renamer))));
        self
    }

    pub fn with_subagent_manager(
        mut self,
        manager: Arc<subagent::Manager>,
        parent_session_id: &str,
    ) -> Self {
        for tool in agent_tools::configured(&self.agent_id, manager, parent_session_id) {
            self.register(tool);
        }
        self
    }

    /// Makes `report_to_parent` available; only wired when the runner is
    /// driven as a subagent.
    pub fn with_parent_session(
        mut self,
        parent_session_id: &str,
        broadcasters: Broadcasters,
        agent_id: &str,
        agent_name: &str,
        avatar_color: &str,
    ) -> Self {
        self.register(Arc::new(ReportToParentTool::new(
            parent_session_id,
            broadcasters,
            agent_id,
            agent_name,
            avatar_color,
        )));
        self
    }

    pub fn with_memory_search(
        mut self,
        tree: MemoryTree,
        embedder: Option<Embedder>,
        api_key: String,
    ) -> Self {
        self.register(Arc::new(memory_search::MemorySearchTool::new(
            tree, embedder, api_key,
        )));
        self
    }

    #[cfg(feature = "browser")]
    pub fn with_browser(mut self, manager: Arc<crate::browser::Manager>) -> Self {
        for tool in browser::tools(manager, &self.agent_id, self.workspace_dir.clone()) {
            self.register(tool);
        }
        self
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools
            .values()
            .map(|t| ToolDef {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.schema(),
            })
            .collect()
    }

    /// Dispatch one tool call. Never panics, never loses the error text: the
    /// outcome body is what goes into the tool_result block.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        name: &str,
        input: &str,
    ) -> DispatchOutcome {
        let Some(tool) = self.tools.get(name) else {
            return DispatchOutcome {
                body: format!(
                    "[{}] unknown tool; available tools: {}",
                    name,
                    self.names().join(", ")
                ),
                is_error: true,
            };
        };

        if serde_json::from_str::<Value>(input).is_err() {
            return DispatchOutcome {
                body: format!("[{}] invalid input: not valid JSON: {}", name, input),
                is_error: true,
            };
        }

        match tool.call(cancel, input).await {
            Ok(output) => DispatchOutcome {
                body: output,
                is_error: false,
            },
            Err(e) => {
                // A tool may fail while still carrying output worth showing
                // (stderr + exit code); combine into one body.
                let body = match e.downcast_ref::<PartialOutput>() {
                    Some(p) if !p.output.is_empty() => {
                        format!("[{}] {}\n{}", name, p.message, p.output)
                    }
                    _ => format!("[{}] {}", name, e),
                };
                DispatchOutcome {
                    body,
                    is_error: true,
                }
            }
        }
    }
}

/// Resolve a tool-supplied path against the agent workspace. Absolute paths
/// pass through; relative paths are workspace-scoped.
pub(crate) fn resolve_path(workspace: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace.join(p)
    }
}
