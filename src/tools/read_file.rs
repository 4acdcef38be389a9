//! `read` — file contents with line numbers and offset/limit selection.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{resolve_path, Tool};

const MAX_LINES_DEFAULT: usize = 2000;

pub struct ReadTool {
    workspace_dir: PathBuf,
}

impl ReadTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file with line numbers. Supports offset/limit for large files."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace or absolute"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based line to start reading from"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let path_str = args["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: file_path"))?;
        let path = resolve_path(&self.workspace_dir, path_str);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!("file not found: {:?}", path_str)
            }
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        let offset = args["offset"].as_u64().map(|n| n as usize).unwrap_or(1);
        let limit = args["limit"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(MAX_LINES_DEFAULT);

        if offset == 0 {
            anyhow::bail!("offset is 1-based, got 0");
        }
        if total == 0 {
            if offset > 1 {
                anyhow::bail!("offset {} exceeds file length 0 lines", offset);
            }
            return Ok(format!("{} (empty file)", path_str));
        }
        if offset > total {
            anyhow::bail!("offset {} exceeds file length {} lines", offset, total);
        }

        let start = offset - 1;
        let end = (start + limit).min(total);
        let mut out = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            out.push_str(&format!("{:>5} | {}\n", start + i + 1, line));
        }
        if end < total {
            out.push_str(&format!("... ({} more lines)\n", total - end));
        }
        Ok(out)
    }
}
