//! AI-visible conversation history index.
//!
//! Layout under `workspace/conversations/`:
//!   `index.json`                      — complete index for all sessions
//!   `INDEX.md`                        — summary injected into the prompt
//!   `{sessionId}__{channelId}.jsonl`  — full per-session+channel messages
//!
//! One mutex per workspace protects both the JSONL appends and the index
//! regeneration; index writes go through a temp file + rename.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Number of conversations rendered into INDEX.md.
const INDEX_MD_LIMIT: usize = 20;
const TITLE_MAX_CHARS: usize = 60;

/// One message record in the per-session JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Entry {
    #[serde(default)]
    pub ts: String,
    pub session_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub channel_type: String,
    /// "user" | "assistant"
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
}

/// Summary metadata for one session+channel conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub session_id: String,
    pub channel_id: String,
    pub channel_type: String,
    pub title: String,
    pub message_count: usize,
    pub created_at: String,
    pub last_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Relative to the workspace directory.
    pub file_path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DiskIndex {
    entries: Vec<IndexEntry>,
}

pub struct Chatlog {
    workspace_dir: PathBuf,
    lock: Mutex<()>,
}

impl Chatlog {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn conversations_dir(&self) -> PathBuf {
        self.workspace_dir.join("conversations")
    }

    /// JSONL path for a session+channel pair. Slashes in either id become
    /// hyphens, spaces become underscores; double underscore separates them.
    fn entry_file_name(session_id: &str, channel_id: &str) -> String {
        let safe = |s: &str| -> String {
            s.chars()
                .map(|c| match c {
                    '/' | '\\' => '-',
                    ' ' => '_',
                    c => c,
                })
                .collect()
        };
        format!("{}__{}.jsonl", safe(session_id), safe(channel_id))
    }

    /// Append an entry, update index.json, and regenerate INDEX.md.
    pub fn append(&self, mut entry: Entry) -> anyhow::Result<()> {
        let _guard = self.lock.lock().expect("chatlog lock");

        let dir = self.conversations_dir();
        std::fs::create_dir_all(&dir)?;

        if entry.ts.is_empty() {
            entry.ts = Utc::now().to_rfc3339();
        }

        let file_name = Self::entry_file_name(&entry.session_id, &entry.channel_id);
        let file_path = dir.join(&file_name);
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)?;
            let line = serde_json::to_string(&entry)?;
            writeln!(f, "{}", line)?;
        }

        let mut idx = self.load_index();
        self.upsert_index_entry(&mut idx, &entry, &file_name);
        self.save_index(&idx)?;
        self.write_index_md(&idx)
    }

    /// Set the summary on every index entry for a session. Called after
    /// compaction completes.
    pub fn update_summary(&self, session_id: &str, summary: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().expect("chatlog lock");
        let mut idx = self.load_index();
        let mut changed = false;
        for e in &mut idx.entries {
            if e.session_id == session_id {
                e.summary = summary.to_string();
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        self.save_index(&idx)?;
        self.write_index_md(&idx)
    }

    /// INDEX.md content, empty when never written.
    pub fn index_md(&self) -> String {
        std::fs::read_to_string(self.conversations_dir().join("INDEX.md")).unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<IndexEntry> {
        self.load_index().entries
    }

    fn load_index(&self) -> DiskIndex {
        let path = self.conversations_dir().join("index.json");
        match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data).unwrap_or_default(),
            Err(_) => DiskIndex::default(),
        }
    }

    fn save_index(&self, idx: &DiskIndex) -> anyhow::Result<()> {
        let path = self.conversations_dir().join("index.json");
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(idx)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn upsert_index_entry(&self, idx: &mut DiskIndex, entry: &Entry, file_name: &str) {
        let existing = idx
            .entries
            .iter_mut()
            .find(|e| e.session_id == entry.session_id && e.channel_id == entry.channel_id);
        match existing {
            Some(e) => {
                e.message_count += 1;
                e.last_at = entry.ts.clone();
                // The title comes from the first user message; fill it in
                // late when the conversation opened with an assistant turn.
                if e.title.is_empty() && entry.role == "user" {
                    e.title = derive_title(&entry.content);
                }
            }
            None => {
                let title = if entry.role == "user" {
                    derive_title(&entry.content)
                } else {
                    String::new()
                };
                idx.entries.push(IndexEntry {
                    session_id: entry.session_id.clone(),
                    channel_id: entry.channel_id.clone(),
                    channel_type: entry.channel_type.clone(),
                    title,
                    message_count: 1,
                    created_at: entry.ts.clone(),
                    last_at: entry.ts.clone(),
                    summary: String::new(),
                    file_path: format!("conversations/{}", file_name),
                });
            }
        }
    }

    fn write_index_md(&self, idx: &DiskIndex) -> anyhow::Result<()> {
        let mut entries: Vec<&IndexEntry> = idx.entries.iter().collect();
        entries.sort_by(|a, b| b.last_at.cmp(&a.last_at));

        let mut md = String::from("# Conversations\n\n");
        for e in entries.iter().take(INDEX_MD_LIMIT) {
            let title = if e.title.is_empty() { "(untitled)" } else { &e.title };
            md.push_str(&format!(
                "- **{}** — {} messages, last {} (`{}`)\n",
                title, e.message_count, e.last_at, e.file_path
            ));
            if !e.summary.is_empty() {
                md.push_str(&format!("  - {}\n", e.summary));
            }
        }

        let path = self.conversations_dir().join("INDEX.md");
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, md)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn derive_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    let mut title: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    if first_line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    title
}
