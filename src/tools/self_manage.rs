//! Self-management tools: rename, skills, per-agent env vars.
//!
//! Env mutations route through an injected updater callback so the agent
//! registry stays the single writer of agent records. Without the callback
//! the tools answer with a clear "not configured" error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{AgentRenamer, EnvUpdater, Tool};
use crate::skills;

pub struct SelfRenameTool {
    renamer: Option<AgentRenamer>,
}

impl SelfRenameTool {
    pub fn new(renamer: Option<AgentRenamer>) -> Self {
        Self { renamer }
    }
}

#[async_trait]
impl Tool for SelfRenameTool {
    fn name(&self) -> &str {
        "self_rename"
    }

    fn description(&self) -> &str {
        "Change this agent's display name."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "New display name" }
            },
            "required": ["name"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let name = args["name"]
            .as_str()
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: name"))?;
        let renamer = self
            .renamer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("agent rename not configured"))?;
        renamer(name.trim())?;
        Ok(format!("renamed to {:?}", name.trim()))
    }
}

pub struct SelfInstallSkillTool {
    workspace_dir: PathBuf,
}

impl SelfInstallSkillTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for SelfInstallSkillTool {
    fn name(&self) -> &str {
        "self_install_skill"
    }

    fn description(&self) -> &str {
        "Install a skill (SKILL.md) into this agent's skill library."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name (directory name)" },
                "content": { "type": "string", "description": "SKILL.md markdown content" }
            },
            "required": ["name", "content"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let name = args["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: name"))?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;
        skills::install(&self.workspace_dir, name, content)?;
        Ok(format!("installed skill {:?} and rebuilt skills/INDEX.md", name))
    }
}

pub struct SelfUninstallSkillTool {
    workspace_dir: PathBuf,
}

impl SelfUninstallSkillTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for SelfUninstallSkillTool {
    fn name(&self) -> &str {
        "self_uninstall_skill"
    }

    fn description(&self) -> &str {
        "Remove a skill from this agent's skill library."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Skill name to remove" }
            },
            "required": ["name"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let name = args["name"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: name"))?;
        skills::uninstall(&self.workspace_dir, name)?;
        Ok(format!("uninstalled skill {:?} and rebuilt skills/INDEX.md", name))
    }
}

pub struct SelfListSkillsTool {
    workspace_dir: PathBuf,
}

impl SelfListSkillsTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for SelfListSkillsTool {
    fn name(&self) -> &str {
        "self_list_skills"
    }

    fn description(&self) -> &str {
        "List installed skills."
    }

    fn schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, _cancel: &CancellationToken, _arguments: &str) -> anyhow::Result<String> {
        let names = skills::list(&self.workspace_dir);
        if names.is_empty() {
            Ok("no skills installed".to_string())
        } else {
            Ok(names.join("\n"))
        }
    }
}

pub struct SelfSetEnvTool {
    updater: Option<EnvUpdater>,
}

impl SelfSetEnvTool {
    pub fn new(updater: Option<EnvUpdater>) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl Tool for SelfSetEnvTool {
    fn name(&self) -> &str {
        "self_set_env"
    }

    fn description(&self) -> &str {
        "Set a persistent environment variable for this agent's shell commands."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Variable name" },
                "value": { "type": "string", "description": "Variable value" }
            },
            "required": ["key", "value"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let key = args["key"]
            .as_str()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: key"))?;
        let value = args["value"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: value"))?;
        let updater = self
            .updater
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("env updater not configured"))?;
        updater(key, Some(value))?;
        Ok(format!("set {}", key))
    }
}

pub struct SelfDeleteEnvTool {
    updater: Option<EnvUpdater>,
}

impl SelfDeleteEnvTool {
    pub fn new(updater: Option<EnvUpdater>) -> Self {
        Self { updater }
    }
}

#[async_trait]
impl Tool for SelfDeleteEnvTool {
    fn name(&self) -> &str {
        "self_delete_env"
    }

    fn description(&self) -> &str {
        "Remove a persistent environment variable from this agent."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": { "type": "string", "description": "Variable name to remove" }
            },
            "required": ["key"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let key = args["key"]
            .as_str()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: key"))?;
        let updater = self
            .updater
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("env updater not configured"))?;
        updater(key, None)?;
        Ok(format!("deleted {}", key))
    }
}
