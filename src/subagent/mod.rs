//! Background subagent tasks: spawn, track, kill, persist, and broadcast
//! lifecycle events to the spawning session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::runner::RunEvent;

const DEFAULT_AVATAR_COLOR: &str = "#6366f1";

/// Parameters handed to the injected run function for one task.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub agent_id: String,
    /// Model override; empty = agent default.
    pub model: String,
    pub session_id: String,
    pub parent_session_id: String,
    pub task: String,
}

/// Executes a task for an agent and streams events. Provided by the pool.
pub type RunFunc =
    Arc<dyn Fn(CancellationToken, RunRequest) -> mpsc::Receiver<RunEvent> + Send + Sync>;

/// Publishes a subagent event onto a session's broadcaster.
pub type BroadcastFn = Arc<dyn Fn(&str, &str, serde_json::Value) + Send + Sync>;

/// Fetches (name, avatar_color) for an agent id.
pub type AgentInfoFn = Arc<dyn Fn(&str) -> Option<(String, String)> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error | TaskStatus::Killed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Task,
    Report,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub label: String,
    #[serde(rename = "task")]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub session_id: String,
    #[serde(default)]
    pub spawned_by: String,
    #[serde(default)]
    pub spawned_by_session: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default)]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub relation: String,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOpts {
    pub agent_id: String,
    pub label: String,
    pub task: String,
    pub model: String,
    pub spawned_by: String,
    pub spawned_by_session: String,
    pub task_type: TaskType,
    pub relation: String,
}

/// The unified event shape published to the parent session's broadcaster as
/// `subagent_{type}`.
fn subagent_event(
    kind: &str,
    task: &Task,
    agent_name: &str,
    avatar_color: &str,
) -> serde_json::Value {
    json!({
        "type": kind,
        "subagentSessionId": task.session_id,
        "agentId": task.agent_id,
        "agentName": agent_name,
        "avatarColor": avatar_color,
        "status": task.status,
        "timestamp": Utc::now().timestamp_millis(),
    })
}

pub struct Manager {
    tasks: Mutex<HashMap<String, Task>>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    run: RunFunc,
    store_dir: Option<PathBuf>,
    broadcast: RwLock<Option<BroadcastFn>>,
    agent_info: RwLock<Option<AgentInfoFn>>,
    /// Per-parent-session event history, retained so a reconnecting UI can
    /// replay the dispatch panel. Separate lock from the task map so event
    /// reads never block task updates.
    events: RwLock<HashMap<String, Vec<serde_json::Value>>>,
}

impl Manager {
    /// `store_dir`: when set, one JSON file per task is kept there. On load,
    /// any task still marked running/pending is flipped to killed — the
    /// process restart interrupted it.
    pub fn new(run: RunFunc, store_dir: Option<PathBuf>) -> Self {
        let m = Self {
            tasks: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            run,
            store_dir,
            broadcast: RwLock::new(None),
            agent_info: RwLock::new(None),
            events: RwLock::new(HashMap::new()),
        };
        if let Some(dir) = &m.store_dir {
            if std::fs::create_dir_all(dir).is_ok() {
                m.load_from_disk();
            }
        }
        m
    }

    pub fn set_broadcaster(&self, f: BroadcastFn) {
        *self.broadcast.write().expect("broadcast lock") = Some(f);
    }

    pub fn set_agent_info(&self, f: AgentInfoFn) {
        *self.agent_info.write().expect("agent info lock") = Some(f);
    }

    /// Stored subagent events for a parent session (dispatch-panel replay).
    pub fn list_events(&self, parent_session_id: &str) -> Vec<serde_json::Value> {
        self.events
            .read()
            .expect("events lock")
            .get(parent_session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn agent_display(&self, agent_id: &str) -> (String, String) {
        let info = self.agent_info.read().expect("agent info lock");
        if let Some(f) = info.as_ref() {
            if let Some((name, color)) = f(agent_id) {
                return (
                    if name.is_empty() { agent_id.to_string() } else { name },
                    if color.is_empty() {
                        DEFAULT_AVATAR_COLOR.to_string()
                    } else {
                        color
                    },
                );
            }
        }
        (agent_id.to_string(), DEFAULT_AVATAR_COLOR.to_string())
    }

    fn publish(&self, parent_session_id: &str, kind: &str, event: serde_json::Value) {
        if parent_session_id.is_empty() {
            return;
        }
        self.events
            .write()
            .expect("events lock")
            .entry(parent_session_id.to_string())
            .or_default()
            .push(event.clone());

        let broadcast = self.broadcast.read().expect("broadcast lock");
        if let Some(f) = broadcast.as_ref() {
            f(parent_session_id, &format!("subagent_{}", kind), event);
        }
    }

    /// Create and start a background task. Returns a snapshot of the task
    /// immediately; execution continues on its own tokio task.
    pub fn spawn(self: Arc<Self>, opts: SpawnOpts) -> anyhow::Result<Task> {
        if opts.agent_id.is_empty() {
            anyhow::bail!("agent_id is required");
        }
        if opts.task.is_empty() {
            anyhow::bail!("task description is required");
        }

        let task_id = uuid::Uuid::new_v4().to_string()[..12].to_string();
        let session_id = format!("subagent-{}", task_id);
        let task = Task {
            id: task_id.clone(),
            agent_id: opts.agent_id,
            label: opts.label,
            description: opts.task,
            status: TaskStatus::Pending,
            output: String::new(),
            error: String::new(),
            session_id: session_id.clone(),
            spawned_by: opts.spawned_by,
            spawned_by_session: opts.spawned_by_session.clone(),
            model: opts.model,
            task_type: opts.task_type,
            relation: opts.relation,
            created_at: Utc::now().timestamp_millis(),
            started_at: 0,
            ended_at: 0,
        };

        let cancel = CancellationToken::new();
        self.tasks
            .lock()
            .expect("tasks lock")
            .insert(task_id.clone(), task.clone());
        self.cancels
            .lock()
            .expect("cancels lock")
            .insert(task_id.clone(), cancel.clone());
        self.persist(&task);

        let (agent_name, avatar_color) = self.agent_display(&task.agent_id);
        self.publish(
            &opts.spawned_by_session,
            "spawn",
            subagent_event("spawn", &task, &agent_name, &avatar_color),
        );

        let mgr = Arc::clone(&self);
        let spawned = task.clone();
        tokio::spawn(async move {
            mgr.run_task(cancel, spawned).await;
        });

        Ok(task)
    }

    async fn run_task(self: Arc<Self>, cancel: CancellationToken, task: Task) {
        let task_id = task.id.clone();
        self.update_task(&task_id, |t| {
            t.status = TaskStatus::Running;
            t.started_at = Utc::now().timestamp_millis();
        });
        info!(task = %task_id, agent = %task.agent_id, "subagent task started");

        let mut events = (self.run)(
            cancel,
            RunRequest {
                agent_id: task.agent_id.clone(),
                model: task.model.clone(),
                session_id: task.session_id.clone(),
                parent_session_id: task.spawned_by_session.clone(),
                task: task.description.clone(),
            },
        );

        let mut task_error: Option<String> = None;
        while let Some(ev) = events.recv().await {
            match ev {
                RunEvent::TextDelta(text) => {
                    self.update_task(&task_id, |t| t.output.push_str(&text));
                }
                RunEvent::Error(e) => task_error = Some(e),
                RunEvent::Done => {}
            }
        }

        let finished = self.update_task(&task_id, |t| {
            t.ended_at = Utc::now().timestamp_millis();
            if t.status != TaskStatus::Killed {
                match &task_error {
                    Some(e) => {
                        t.status = TaskStatus::Error;
                        t.error = e.clone();
                    }
                    None => t.status = TaskStatus::Done,
                }
            }
        });

        let Some(finished) = finished else { return };
        info!(task = %task_id, status = ?finished.status, "subagent task finished");

        let kind = match finished.status {
            TaskStatus::Done => "done",
            _ => "error",
        };
        let (agent_name, avatar_color) = self.agent_display(&finished.agent_id);
        self.publish(
            &finished.spawned_by_session,
            kind,
            subagent_event(kind, &finished, &agent_name, &avatar_color),
        );
    }

    /// Cancel a running task. Terminal tasks are left untouched.
    pub fn kill(&self, task_id: &str) -> anyhow::Result<Task> {
        let status = {
            let tasks = self.tasks.lock().expect("tasks lock");
            let task = tasks
                .get(task_id)
                .ok_or_else(|| anyhow::anyhow!("task {:?} not found", task_id))?;
            task.status
        };
        if status.is_terminal() {
            anyhow::bail!("task {:?} is not running (status: {:?})", task_id, status);
        }

        if let Some(cancel) = self.cancels.lock().expect("cancels lock").get(task_id) {
            cancel.cancel();
        }
        let updated = self.update_task(task_id, |t| {
            t.status = TaskStatus::Killed;
            t.ended_at = Utc::now().timestamp_millis();
        });
        updated.ok_or_else(|| anyhow::anyhow!("task {:?} not found", task_id))
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.lock().expect("tasks lock").get(task_id).cloned()
    }

    /// All tasks, newest first. Non-empty `agent_id` filters.
    pub fn list(&self, agent_id: &str) -> Vec<Task> {
        let tasks = self.tasks.lock().expect("tasks lock");
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| agent_id.is_empty() || t.agent_id == agent_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    /// Apply a mutation under the task lock and persist the result.
    fn update_task(&self, task_id: &str, f: impl FnOnce(&mut Task)) -> Option<Task> {
        let updated = {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            let task = tasks.get_mut(task_id)?;
            f(task);
            task.clone()
        };
        self.persist(&updated);
        Some(updated)
    }

    fn persist(&self, task: &Task) {
        let Some(dir) = &self.store_dir else { return };
        let path = dir.join(format!("{}.json", task.id));
        match serde_json::to_vec_pretty(task) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&path, data) {
                    warn!(task = %task.id, "task persist failed: {}", e);
                }
            }
            Err(e) => warn!(task = %task.id, "task serialize failed: {}", e),
        }
    }

    fn load_from_disk(&self) {
        let Some(dir) = &self.store_dir else { return };
        let Ok(entries) = std::fs::read_dir(dir) else { return };
        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else { continue };
            let Ok(mut task) = serde_json::from_str::<Task>(&data) else { continue };
            // Running tasks did not survive the restart.
            if matches!(task.status, TaskStatus::Running | TaskStatus::Pending) {
                task.status = TaskStatus::Killed;
                task.error = "server restarted".to_string();
                task.ended_at = Utc::now().timestamp_millis();
                self.persist(&task);
            }
            self.tasks
                .lock()
                .expect("tasks lock")
                .insert(task.id.clone(), task);
            loaded += 1;
        }
        if loaded > 0 {
            info!(count = loaded, "loaded subagent tasks from disk");
        }
    }
}
