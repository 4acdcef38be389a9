//! `grep` and `glob` — workspace content and filename search.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{resolve_path, Tool};

const MAX_MATCHES: usize = 200;
const MAX_GLOB_RESULTS: usize = 500;

pub struct GrepTool {
    workspace_dir: PathBuf,
}

impl GrepTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }

    fn grep_file(re: &Regex, path: &Path, display: &str, out: &mut Vec<String>) {
        let Ok(content) = std::fs::read_to_string(path) else {
            return; // skip binary / unreadable
        };
        for (i, line) in content.lines().enumerate() {
            if out.len() >= MAX_MATCHES {
                return;
            }
            if re.is_match(line) {
                out.push(format!("{}:{}: {}", display, i + 1, line.trim_end()));
            }
        }
    }

    fn grep_dir(re: &Regex, dir: &Path, base: &Path, recursive: bool, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            if out.len() >= MAX_MATCHES {
                return;
            }
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                if recursive {
                    Self::grep_dir(re, &path, base, recursive, out);
                }
            } else {
                let display = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                Self::grep_file(re, &path, &display, out);
            }
        }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: workspace root)"
                },
                "recursive": {
                    "type": "boolean",
                    "description": "Recurse into subdirectories (default: false)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: pattern"))?;
        let re = Regex::new(pattern)
            .map_err(|e| anyhow::anyhow!("invalid regex {:?}: {}", pattern, e))?;
        let recursive = args["recursive"].as_bool().unwrap_or(false);
        let target = match args["path"].as_str() {
            Some(p) => resolve_path(&self.workspace_dir, p),
            None => self.workspace_dir.clone(),
        };

        let mut matches = Vec::new();
        if target.is_dir() {
            Self::grep_dir(&re, &target, &target, recursive, &mut matches);
        } else if target.is_file() {
            let display = target.to_string_lossy().into_owned();
            Self::grep_file(&re, &target, &display, &mut matches);
        } else {
            anyhow::bail!("path not found: {:?}", target);
        }

        if matches.is_empty() {
            return Ok(format!("no matches for {:?}", pattern));
        }
        let mut out = matches.join("\n");
        if matches.len() >= MAX_MATCHES {
            out.push_str("\n... (match limit reached)");
        }
        Ok(out)
    }
}

pub struct GlobTool {
    workspace_dir: PathBuf,
}

impl GlobTool {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern, e.g. \"memory/**/*.md\"."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern, relative to the workspace or absolute"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let pattern = args["pattern"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: pattern"))?;

        let full_pattern = if Path::new(pattern).is_absolute() {
            pattern.to_string()
        } else {
            self.workspace_dir.join(pattern).to_string_lossy().into_owned()
        };

        let paths = glob::glob(&full_pattern)
            .map_err(|e| anyhow::anyhow!("invalid glob {:?}: {}", pattern, e))?;

        let mut results = Vec::new();
        for path in paths.flatten() {
            if results.len() >= MAX_GLOB_RESULTS {
                break;
            }
            let display = path
                .strip_prefix(&self.workspace_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            results.push(display);
        }

        if results.is_empty() {
            return Ok(format!("no files match {:?}", pattern));
        }
        Ok(results.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha beta\ngamma\n").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "beta delta\n").unwrap();
        std::fs::write(dir.path().join("sub/c.md"), "# notes\n").unwrap();
        dir
    }

    async fn run(tool: &dyn Tool, args: Value) -> anyhow::Result<String> {
        tool.call(&CancellationToken::new(), &args.to_string()).await
    }

    #[tokio::test]
    async fn grep_finds_matches_with_line_numbers() {
        let dir = setup();
        let tool = GrepTool::new(dir.path());
        let out = run(&tool, json!({"pattern": "beta"})).await.unwrap();
        assert!(out.contains("a.txt:1:"));
        // non-recursive by default
        assert!(!out.contains("sub/b.txt"));
    }

    #[tokio::test]
    async fn grep_recursive_descends() {
        let dir = setup();
        let tool = GrepTool::new(dir.path());
        let out = run(&tool, json!({"pattern": "beta", "recursive": true}))
            .await
            .unwrap();
        assert!(out.contains("a.txt:1:"));
        assert!(out.contains("sub/b.txt:1:"));
    }

    #[tokio::test]
    async fn grep_invalid_regex_errors() {
        let dir = setup();
        let tool = GrepTool::new(dir.path());
        let err = run(&tool, json!({"pattern": "[unclosed"})).await.unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[tokio::test]
    async fn grep_no_matches_is_not_an_error() {
        let dir = setup();
        let tool = GrepTool::new(dir.path());
        let out = run(&tool, json!({"pattern": "zzzznope"})).await.unwrap();
        assert!(out.contains("no matches"));
    }

    #[tokio::test]
    async fn glob_matches_patterns() {
        let dir = setup();
        let tool = GlobTool::new(dir.path());
        let out = run(&tool, json!({"pattern": "**/*.txt"})).await.unwrap();
        assert!(out.contains("a.txt"));
        assert!(out.contains("sub/b.txt"));
        assert!(!out.contains("c.md"));
    }

    #[tokio::test]
    async fn glob_no_matches_reports_cleanly() {
        let dir = setup();
        let tool = GlobTool::new(dir.path());
        let out = run(&tool, json!({"pattern": "*.rs"})).await.unwrap();
        assert!(out.contains("no files match"));
    }
}
