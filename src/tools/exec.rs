//! `exec` — shell command execution in the agent workspace.
//!
//! stdout and stderr are merged so the model sees interleaved output. A
//! non-zero exit code is a *result*, not an error — the model needs the
//! full output to decide what to do next.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Tool;

const MAX_OUTPUT_BYTES: usize = 100 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub struct ExecTool {
    workspace_dir: PathBuf,
    env: HashMap<String, String>,
}

impl ExecTool {
    pub fn new(workspace_dir: &Path, env: HashMap<String, String>) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
            env,
        }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Returns merged stdout/stderr and the exit code."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command line to execute"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Kill the command after this many seconds (default 120)"
                }
            },
            "required": ["command"]
        })
    }

    async fn call(&self, cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let command = args["command"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: command"))?;
        let timeout_secs = args["timeout_secs"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        debug!(command, "exec");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn shell: {}", e))?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let out_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let err_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        // The wait future borrows the child; it must be dropped before we
        // can kill on timeout/cancel.
        let waited = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            async {
                tokio::select! {
                    status = child.wait() => Some(status),
                    _ = cancel.cancelled() => None,
                }
            },
        )
        .await;
        let status = match waited {
            Ok(Some(status)) => status?,
            Ok(None) => {
                let _ = child.kill().await;
                anyhow::bail!("command cancelled");
            }
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("command timed out after {}s", timeout_secs);
            }
        };

        let mut merged = out_task.await.unwrap_or_default();
        merged.extend(err_task.await.unwrap_or_default());
        let mut output = String::from_utf8_lossy(&merged).into_owned();
        if output.len() > MAX_OUTPUT_BYTES {
            let mut end = MAX_OUTPUT_BYTES;
            while end > 0 && !output.is_char_boundary(end) {
                end -= 1;
            }
            output.truncate(end);
            output.push_str("\n... (output truncated)");
        }

        let code = status.code().unwrap_or(-1);
        if code == 0 {
            if output.is_empty() {
                Ok("(no output, exit 0)".to_string())
            } else {
                Ok(output)
            }
        } else {
            // Exit code as a result, not an error.
            Ok(format!("{}\n(exit code {})", output.trim_end(), code))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(dir: &Path) -> ExecTool {
        ExecTool::new(dir, HashMap::new())
    }

    async fn run(t: &ExecTool, args: Value) -> anyhow::Result<String> {
        t.call(&CancellationToken::new(), &args.to_string()).await
    }

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(&tool(dir.path()), json!({"command": "echo hello"}))
            .await
            .unwrap();
        assert!(out.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_with_merged_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = run(
            &tool(dir.path()),
            json!({"command": "echo to-stderr >&2; exit 3"}),
        )
        .await
        .unwrap();
        assert!(out.contains("to-stderr"));
        assert!(out.contains("exit code 3"));
    }

    #[tokio::test]
    async fn runs_in_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = run(&tool(dir.path()), json!({"command": "ls"})).await.unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn agent_env_is_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("AGENT_SECRET".to_string(), "shhh42".to_string());
        let t = ExecTool::new(dir.path(), env);
        let out = run(&t, json!({"command": "echo $AGENT_SECRET"})).await.unwrap();
        assert!(out.contains("shhh42"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(
            &tool(dir.path()),
            json!({"command": "sleep 30", "timeout_secs": 1}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let t = tool(dir.path());
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            c2.cancel();
        });
        let err = t
            .call(&cancel, &json!({"command": "sleep 30"}).to_string())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
