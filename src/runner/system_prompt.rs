//! System prompt assembly from the agent workspace.
//!
//! Injection order: current time, IDENTITY.md, SOUL.md, memory/INDEX.md
//! (legacy MEMORY.md fallback), access hints, RELATIONS.md, skills/INDEX.md,
//! conversations/INDEX.md, AGENTS.md plus the files it references, and the
//! shared project context. Each file is truncated to a head+tail window with
//! a visible marker; the full file stays reachable via the `read` tool.

use std::path::Path;

use chrono::Utc;
use chrono_tz::Asia::Shanghai;

/// Per-file injection cap (chars, ≈5K tokens).
const FILE_MAX_CHARS: usize = 20_000;
const HEAD_RATIO: f64 = 0.70;
const TAIL_RATIO: f64 = 0.20;

pub fn build(workspace_dir: &Path, project_context: &str) -> String {
    let mut out = String::new();

    let now = Utc::now().with_timezone(&Shanghai);
    out.push_str(&format!(
        "Current date and time: {}\n\n",
        now.format("%Y-%m-%d %H:%M:%S %Z")
    ));

    inject_file(&mut out, workspace_dir.join("IDENTITY.md"), "IDENTITY.md");
    inject_file(&mut out, workspace_dir.join("SOUL.md"), "SOUL.md");

    let memory_index = read_if_exists(&workspace_dir.join("memory/INDEX.md"));
    if !memory_index.trim().is_empty() {
        push_section(
            &mut out,
            "memory/INDEX.md",
            &truncate_for_prompt(memory_index.trim(), "memory/INDEX.md"),
        );
    } else {
        inject_file(&mut out, workspace_dir.join("MEMORY.md"), "MEMORY.md");
    }

    out.push_str(
        "[Memory tree available. Use the read tool to access: memory/core/, \
         memory/projects/, memory/daily/, memory/topics/]\n\n",
    );
    out.push_str(
        "[Conversation history available. Use the read tool: \
         conversations/INDEX.md for the index, \
         conversations/{sessionId}__{channelId}.jsonl for full transcripts]\n\n",
    );

    inject_file(&mut out, workspace_dir.join("RELATIONS.md"), "RELATIONS.md");
    inject_file(&mut out, workspace_dir.join("skills/INDEX.md"), "skills/INDEX.md");
    inject_file(
        &mut out,
        workspace_dir.join("conversations/INDEX.md"),
        "conversations/INDEX.md",
    );

    let agents_md = read_if_exists(&workspace_dir.join("AGENTS.md"));
    if !agents_md.trim().is_empty() {
        push_section(
            &mut out,
            "AGENTS.md",
            &truncate_for_prompt(agents_md.trim(), "AGENTS.md"),
        );
        for referenced in referenced_files(&agents_md) {
            let path = if Path::new(&referenced).is_absolute() {
                Path::new(&referenced).to_path_buf()
            } else {
                workspace_dir.join(&referenced)
            };
            let content = read_if_exists(&path);
            if !content.trim().is_empty() {
                push_section(
                    &mut out,
                    &referenced,
                    &truncate_for_prompt(content.trim(), &referenced),
                );
            }
        }
    }

    if !project_context.is_empty() {
        out.push_str(project_context);
        out.push_str("\n\n");
    }

    out
}

/// Lines of AGENTS.md that look like file references: everything except
/// blanks, comments, and list items.
fn referenced_files(agents_md: &str) -> Vec<String> {
    agents_md
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
        .map(String::from)
        .collect()
}

fn inject_file(out: &mut String, path: impl AsRef<Path>, label: &str) {
    let content = read_if_exists(path.as_ref());
    if content.trim().is_empty() {
        return;
    }
    push_section(out, label, &truncate_for_prompt(content.trim(), label));
}

fn push_section(out: &mut String, label: &str, content: &str) {
    out.push_str(&format!("--- {} ---\n{}\n\n", label, content));
}

fn read_if_exists(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Keep the head (most important instructions) and the tail (newest
/// content), with a marker naming the file so the model can fetch the rest.
pub fn truncate_for_prompt(content: &str, filename: &str) -> String {
    if content.len() <= FILE_MAX_CHARS {
        return content.to_string();
    }
    let head_len = floor_char_boundary(content, (FILE_MAX_CHARS as f64 * HEAD_RATIO) as usize);
    let tail_len = (FILE_MAX_CHARS as f64 * TAIL_RATIO) as usize;
    let tail_start = floor_char_boundary(content, content.len().saturating_sub(tail_len));
    format!(
        "{}\n\n[... truncated ({} chars total); read the full file with the read tool: {} ...]\n\n{}",
        &content[..head_len],
        content.len(),
        filename,
        &content[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn includes_identity_soul_and_hints() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("IDENTITY.md"), "I am Ray.").unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "Curious and careful.").unwrap();
        let prompt = build(dir.path(), "");
        let identity_pos = prompt.find("--- IDENTITY.md ---").unwrap();
        let soul_pos = prompt.find("--- SOUL.md ---").unwrap();
        assert!(identity_pos < soul_pos);
        assert!(prompt.contains("I am Ray."));
        assert!(prompt.contains("[Memory tree available"));
        assert!(prompt.contains("[Conversation history available"));
        assert!(prompt.starts_with("Current date and time:"));
    }

    #[test]
    fn memory_index_preferred_over_legacy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/INDEX.md"), "memory summary").unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "legacy memory").unwrap();
        let prompt = build(dir.path(), "");
        assert!(prompt.contains("memory summary"));
        assert!(!prompt.contains("legacy memory"));
    }

    #[test]
    fn legacy_memory_used_when_index_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("MEMORY.md"), "legacy memory").unwrap();
        let prompt = build(dir.path(), "");
        assert!(prompt.contains("legacy memory"));
    }

    #[test]
    fn agents_md_pulls_referenced_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("AGENTS.md"),
            "# Guidelines\n- a bullet\nstyle.md\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("style.md"), "Always use tabs.").unwrap();
        let prompt = build(dir.path(), "");
        assert!(prompt.contains("--- AGENTS.md ---"));
        assert!(prompt.contains("--- style.md ---"));
        assert!(prompt.contains("Always use tabs."));
    }

    #[test]
    fn referenced_files_skips_comments_and_bullets() {
        let refs = referenced_files("# heading\n- bullet\n\nnotes/a.md\n /abs/b.md\n");
        assert_eq!(refs, vec!["notes/a.md", "/abs/b.md"]);
    }

    #[test]
    fn project_context_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = build(dir.path(), "--- projects ---\nproj-1: docs");
        assert!(prompt.contains("proj-1: docs"));
    }

    #[test]
    fn oversized_files_get_head_tail_and_marker() {
        let head_marker = "HEADSTART";
        let tail_marker = "TAILEND";
        let mut content = String::from(head_marker);
        content.push_str(&"x".repeat(30_000));
        content.push_str(tail_marker);

        let result = truncate_for_prompt(&content, "BIG.md");
        assert!(result.len() < content.len());
        assert!(result.contains(head_marker));
        assert!(result.contains(tail_marker));
        assert!(result.contains("truncated"));
        assert!(result.contains("BIG.md"));
        assert!(result.contains(&format!("{} chars", content.len())));
    }

    #[test]
    fn truncation_is_utf8_safe() {
        let content = "好".repeat(10_000); // 30k bytes
        let result = truncate_for_prompt(&content, "CN.md");
        // Must not panic and must keep only whole characters.
        assert!(result.chars().all(|c| c == '好' || c.is_ascii()));
    }

    #[test]
    fn small_files_untouched() {
        assert_eq!(truncate_for_prompt("short", "S.md"), "short");
    }
}
