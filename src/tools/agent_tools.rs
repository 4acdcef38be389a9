//! Inter-agent tools: spawn background subagents, inspect and kill them,
//! fetch their results, and report progress to the parent session.
//!
//! All four agent_* tools are registered unconditionally; when no subagent
//! manager is attached they answer with a clear "not configured" error so
//! the model never sees "unknown tool" for a documented capability.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Tool;
use crate::broadcast::Broadcasters;
use crate::subagent::{Manager, SpawnOpts, TaskType};

fn manager_or_err(mgr: &Option<Arc<Manager>>) -> anyhow::Result<&Arc<Manager>> {
    mgr.as_ref()
        .ok_or_else(|| anyhow::anyhow!("subagent manager not configured"))
}

/// The registry's default set: present, but unconfigured.
pub fn unconfigured(agent_id: &str) -> Vec<Arc<dyn Tool>> {
    build(agent_id, None, "")
}

pub fn configured(
    agent_id: &str,
    manager: Arc<Manager>,
    parent_session_id: &str,
) -> Vec<Arc<dyn Tool>> {
    build(agent_id, Some(manager), parent_session_id)
}

fn build(
    agent_id: &str,
    manager: Option<Arc<Manager>>,
    parent_session_id: &str,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(AgentSpawnTool {
            manager: manager.clone(),
            spawned_by: agent_id.to_string(),
            parent_session_id: parent_session_id.to_string(),
        }) as Arc<dyn Tool>,
        Arc::new(AgentTasksTool {
            manager: manager.clone(),
        }),
        Arc::new(AgentKillTool {
            manager: manager.clone(),
        }),
        Arc::new(AgentResultTool { manager }),
    ]
}

pub struct AgentSpawnTool {
    manager: Option<Arc<Manager>>,
    spawned_by: String,
    parent_session_id: String,
}

#[async_trait]
impl Tool for AgentSpawnTool {
    fn name(&self) -> &str {
        "agent_spawn"
    }

    fn description(&self) -> &str {
        "Spawn another agent as a background task. Returns the task id immediately."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string", "description": "Target agent id" },
                "task": { "type": "string", "description": "Task prompt for the subagent" },
                "label": { "type": "string", "description": "Optional human-readable label" },
                "model": { "type": "string", "description": "Optional model override" }
            },
            "required": ["agent_id", "task"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let mgr = manager_or_err(&self.manager)?;
        let args: Value = serde_json::from_str(arguments)?;
        let agent_id = args["agent_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: agent_id"))?;
        let task = args["task"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task"))?;

        let spawned = mgr.clone().spawn(SpawnOpts {
            agent_id: agent_id.to_string(),
            label: args["label"].as_str().unwrap_or("").to_string(),
            task: task.to_string(),
            model: args["model"].as_str().unwrap_or("").to_string(),
            spawned_by: self.spawned_by.clone(),
            spawned_by_session: self.parent_session_id.clone(),
            task_type: TaskType::Task,
            relation: String::new(),
        })?;

        Ok(format!(
            "spawned task {} (agent {}, session {}); check progress with agent_tasks, \
             fetch output with agent_result",
            spawned.id, spawned.agent_id, spawned.session_id
        ))
    }
}

pub struct AgentTasksTool {
    manager: Option<Arc<Manager>>,
}

#[async_trait]
impl Tool for AgentTasksTool {
    fn name(&self) -> &str {
        "agent_tasks"
    }

    fn description(&self) -> &str {
        "List background subagent tasks and their statuses."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string", "description": "Filter to one agent (optional)" }
            }
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let mgr = manager_or_err(&self.manager)?;
        let args: Value = serde_json::from_str(arguments)?;
        let filter = args["agent_id"].as_str().unwrap_or("");
        let tasks = mgr.list(filter);
        if tasks.is_empty() {
            return Ok("no tasks".to_string());
        }
        let mut out = String::new();
        for t in tasks {
            let elapsed = match (t.started_at, t.ended_at) {
                (0, _) => "—".to_string(),
                (s, 0) => format!("{}s", (Utc::now().timestamp_millis() - s) / 1000),
                (s, e) => format!("{}s", (e - s).max(0) / 1000),
            };
            out.push_str(&format!(
                "{}  [{:?}]  agent={}  {}  ({})\n",
                t.id,
                t.status,
                t.agent_id,
                if t.label.is_empty() { &t.description } else { &t.label },
                elapsed
            ));
        }
        Ok(out)
    }
}

pub struct AgentKillTool {
    manager: Option<Arc<Manager>>,
}

#[async_trait]
impl Tool for AgentKillTool {
    fn name(&self) -> &str {
        "agent_kill"
    }

    fn description(&self) -> &str {
        "Cancel a running subagent task."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string", "description": "Task id to cancel" }
            },
            "required": ["task_id"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let mgr = manager_or_err(&self.manager)?;
        let args: Value = serde_json::from_str(arguments)?;
        let task_id = args["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task_id"))?;
        let task = mgr.kill(task_id)?;
        Ok(format!("killed task {}", task.id))
    }
}

pub struct AgentResultTool {
    manager: Option<Arc<Manager>>,
}

#[async_trait]
impl Tool for AgentResultTool {
    fn name(&self) -> &str {
        "agent_result"
    }

    fn description(&self) -> &str {
        "Fetch the status and accumulated output of a subagent task."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string", "description": "Task id to inspect" }
            },
            "required": ["task_id"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let mgr = manager_or_err(&self.manager)?;
        let args: Value = serde_json::from_str(arguments)?;
        let task_id = args["task_id"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: task_id"))?;
        let task = mgr
            .get(task_id)
            .ok_or_else(|| anyhow::anyhow!("task {:?} not found", task_id))?;

        let mut out = format!("task {}: {:?}\n", task.id, task.status);
        if !task.error.is_empty() {
            out.push_str(&format!("error: {}\n", task.error));
        }
        if !task.output.is_empty() {
            out.push_str(&task.output);
        }
        Ok(out)
    }
}

/// Publishes a structured progress event to the parent session's
/// broadcaster. Only registered when the runner is driven as a subagent.
pub struct ReportToParentTool {
    parent_session_id: String,
    broadcasters: Broadcasters,
    agent_id: String,
    agent_name: String,
    avatar_color: String,
}

impl ReportToParentTool {
    pub fn new(
        parent_session_id: &str,
        broadcasters: Broadcasters,
        agent_id: &str,
        agent_name: &str,
        avatar_color: &str,
    ) -> Self {
        Self {
            parent_session_id: parent_session_id.to_string(),
            broadcasters,
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            avatar_color: avatar_color.to_string(),
        }
    }
}

#[async_trait]
impl Tool for ReportToParentTool {
    fn name(&self) -> &str {
        "report_to_parent"
    }

    fn description(&self) -> &str {
        "Send a progress report to the session that spawned this subagent."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "Progress message" },
                "progress": {
                    "type": "integer",
                    "description": "Completion percentage 0-100 (optional)"
                }
            },
            "required": ["content"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let content = args["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: content"))?;

        let mut event = json!({
            "type": "report",
            "subagentSessionId": "",
            "agentId": self.agent_id,
            "agentName": self.agent_name,
            "avatarColor": self.avatar_color,
            "content": content,
            "timestamp": Utc::now().timestamp_millis(),
        });
        if let Some(progress) = args["progress"].as_i64() {
            event["progress"] = json!(progress.clamp(0, 100));
        }

        self.broadcasters
            .publish(&self.parent_session_id, "subagent_report", event);
        Ok("reported".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunEvent;
    use crate::subagent::RunRequest;
    use tokio::sync::mpsc;

    fn instant_run() -> crate::subagent::RunFunc {
        Arc::new(|_cancel: CancellationToken, _req: RunRequest| {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(RunEvent::TextDelta("answer: 42".into())).await;
                let _ = tx.send(RunEvent::Done).await;
            });
            rx
        })
    }

    #[tokio::test]
    async fn spawn_then_result_round_trip() {
        let mgr = Arc::new(Manager::new(instant_run(), None));
        let tools = configured("main", mgr.clone(), "sess-7");
        let spawn = &tools[0];

        let out = spawn
            .call(
                &CancellationToken::new(),
                &json!({"agent_id": "researcher", "task": "find X"}).to_string(),
            )
            .await
            .unwrap();
        assert!(out.contains("spawned task"));

        let task = &mgr.list("")[0];
        assert_eq!(task.spawned_by, "main");
        assert_eq!(task.spawned_by_session, "sess-7");

        for _ in 0..100 {
            if mgr.get(&task.id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let result_tool = &tools[3];
        let out = result_tool
            .call(
                &CancellationToken::new(),
                &json!({"task_id": task.id}).to_string(),
            )
            .await
            .unwrap();
        assert!(out.contains("Done"));
        assert!(out.contains("answer: 42"));
    }

    #[tokio::test]
    async fn tasks_tool_lists_and_kill_rejects_unknown() {
        let mgr = Arc::new(Manager::new(instant_run(), None));
        let tools = configured("main", mgr.clone(), "");

        let list_out = tools[1].call(&CancellationToken::new(), "{}").await.unwrap();
        assert_eq!(list_out, "no tasks");

        let err = tools[2]
            .call(
                &CancellationToken::new(),
                &json!({"task_id": "ghost"}).to_string(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn report_to_parent_publishes_envelope() {
        let broadcasters = Broadcasters::new();
        let mut rx = broadcasters.subscribe("sess-42");
        let tool = ReportToParentTool::new(
            "sess-42",
            broadcasters,
            "researcher",
            "Researcher",
            "#aabbcc",
        );
        tool.call(
            &CancellationToken::new(),
            &json!({"content": "halfway there", "progress": 50}).to_string(),
        )
        .await
        .unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, "subagent_report");
        assert_eq!(ev.data["type"], "report");
        assert_eq!(ev.data["content"], "halfway there");
        assert_eq!(ev.data["progress"], 50);
        assert_eq!(ev.data["agentName"], "Researcher");
    }
}
