//! `edit` — exact first-occurrence string replacement.
//!
//! When the old string isn't found, the error embeds a bounded preview of
//! the file plus its byte count so the model can debug whitespace and
//! indentation mismatches instead of retrying blind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{resolve_path, Tool};

const PREVIEW_MAX_BYTES: usize = 1500;

pub struct EditTool {
    workspace_dir: PathBuf,
}

impl EditTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace the first exact occurrence of a string in a file."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, relative to the workspace or absolute"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to find (including whitespace)"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                }
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let path_str = args["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: file_path"))?;
        let old_string = args["old_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: old_string"))?;
        let new_string = args["new_string"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: new_string"))?;
        if old_string.is_empty() {
            anyhow::bail!("old_string must not be empty");
        }

        let path = resolve_path(&self.workspace_dir, path_str);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!("file not found: {:?}", path_str)
            }
            Err(e) => return Err(e.into()),
        };

        if !content.contains(old_string) {
            anyhow::bail!(
                "old_string not found in {} ({} bytes). File preview:\n{}",
                path_str,
                content.len(),
                preview(&content)
            );
        }

        let new_content = content.replacen(old_string, new_string, 1);
        let tmp = path.with_extension("tmp_edit");
        tokio::fs::write(&tmp, &new_content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(format!("edited {}: replaced 1 occurrence", path_str))
    }
}

fn preview(content: &str) -> &str {
    if content.len() <= PREVIEW_MAX_BYTES {
        return content;
    }
    let mut end = PREVIEW_MAX_BYTES;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn call(tool: &EditTool, args: Value) -> anyhow::Result<String> {
        tool.call(&CancellationToken::new(), &args.to_string()).await
    }

    #[tokio::test]
    async fn replaces_first_occurrence_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "hello world and hello moon").unwrap();
        let tool = EditTool::new(dir.path());
        let out = call(
            &tool,
            json!({"file_path": "note.txt", "old_string": "hello world", "new_string": "hi world"}),
        )
        .await
        .unwrap();
        assert!(out.contains("replaced 1 occurrence"));
        let content = std::fs::read_to_string(dir.path().join("note.txt")).unwrap();
        assert_eq!(content, "hi world and hello moon");
    }

    #[tokio::test]
    async fn no_match_error_embeds_preview_and_byte_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("note.txt"), "actual  content with  spaces").unwrap();
        let tool = EditTool::new(dir.path());
        let err = call(
            &tool,
            json!({"file_path": "note.txt", "old_string": "actual content", "new_string": "x"}),
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not found"));
        assert!(msg.contains("28 bytes"));
        assert!(msg.contains("actual  content"));
    }

    #[tokio::test]
    async fn empty_old_string_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x").unwrap();
        let tool = EditTool::new(dir.path());
        let err = call(
            &tool,
            json!({"file_path": "f.txt", "old_string": "", "new_string": "y"}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = EditTool::new(dir.path());
        let err = call(
            &tool,
            json!({"file_path": "nope.txt", "old_string": "a", "new_string": "b"}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
