//! Agent skill packages.
//!
//! A skill is `workspace/skills/{name}/SKILL.md`. Install and uninstall both
//! rebuild `skills/INDEX.md`, the lightweight catalogue injected into the
//! system prompt.

use std::path::{Path, PathBuf};

fn skills_dir(workspace: &Path) -> PathBuf {
    workspace.join("skills")
}

/// Install (or overwrite) a skill and rebuild the index.
pub fn install(workspace: &Path, name: &str, content: &str) -> anyhow::Result<()> {
    validate_name(name)?;
    let dir = skills_dir(workspace).join(name);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join("SKILL.md"), content)?;
    rebuild_index(workspace)
}

/// Remove a skill directory and rebuild the index.
pub fn uninstall(workspace: &Path, name: &str) -> anyhow::Result<()> {
    validate_name(name)?;
    let dir = skills_dir(workspace).join(name);
    if !dir.join("SKILL.md").exists() {
        anyhow::bail!("skill {:?} not found", name);
    }
    std::fs::remove_dir_all(&dir)?;
    rebuild_index(workspace)
}

/// Names of all installed skills, sorted.
pub fn list(workspace: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(skills_dir(workspace)) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join("SKILL.md").exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    names.sort();
    names
}

/// Regenerate `skills/INDEX.md` from the installed skill files. Each line
/// carries the skill name and its first heading (or first non-empty line).
pub fn rebuild_index(workspace: &Path) -> anyhow::Result<()> {
    let dir = skills_dir(workspace);
    std::fs::create_dir_all(&dir)?;

    let mut md = String::from("# Skills\n\n");
    for name in list(workspace) {
        let content =
            std::fs::read_to_string(dir.join(&name).join("SKILL.md")).unwrap_or_default();
        let summary = first_summary_line(&content);
        if summary.is_empty() {
            md.push_str(&format!("- **{}**\n", name));
        } else {
            md.push_str(&format!("- **{}** — {}\n", name, summary));
        }
    }
    std::fs::write(dir.join("INDEX.md"), md)?;
    Ok(())
}

fn first_summary_line(content: &str) -> String {
    content
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        anyhow::bail!("invalid skill name {:?}", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_list_uninstall_cycle() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "weather", "# Weather lookups\nUse the wttr API.").unwrap();
        install(dir.path(), "deploy", "# Deployments\nShip it.").unwrap();

        assert_eq!(list(dir.path()), vec!["deploy", "weather"]);
        let idx = std::fs::read_to_string(dir.path().join("skills/INDEX.md")).unwrap();
        assert!(idx.contains("**weather** — Weather lookups"));
        assert!(idx.contains("**deploy** — Deployments"));

        uninstall(dir.path(), "weather").unwrap();
        assert_eq!(list(dir.path()), vec!["deploy"]);
        let idx = std::fs::read_to_string(dir.path().join("skills/INDEX.md")).unwrap();
        assert!(!idx.contains("weather"));
    }

    #[test]
    fn uninstall_missing_skill_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = uninstall(dir.path(), "ghost").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn path_traversal_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(install(dir.path(), "../evil", "x").is_err());
        assert!(install(dir.path(), "a/b", "x").is_err());
        assert!(install(dir.path(), ".hidden", "x").is_err());
        assert!(install(dir.path(), "", "x").is_err());
    }
}
