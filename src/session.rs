//! Append-only per-session message store.
//!
//! One JSON file per session id under the agent's session directory. The
//! runner loads at turn start, appends as the tool loop progresses, and
//! saves at the end. An empty session id means ephemeral: no load, no save.

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::llm::ChatMessage;

pub struct Store {
    dir: PathBuf,
}

impl Store {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        let safe: String = session_id
            .chars()
            .map(|c| match c {
                '/' | '\\' => '-',
                ' ' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Load session history. Missing file or ephemeral id → empty history.
    pub async fn load(&self, session_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        if session_id.is_empty() {
            return Ok(Vec::new());
        }
        match tokio::fs::read_to_string(self.path(session_id)).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the full history atomically. Ephemeral id → no-op.
    pub async fn save(&self, session_id: &str, messages: &[ChatMessage]) -> anyhow::Result<()> {
        if session_id.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(session_id);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(messages)?;
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub fn session_dir(&self) -> &PathBuf {
        &self.dir
    }
}

/// Collapse everything before the last `keep_last` messages into a single
/// synthetic user message carrying `summary`. Returns true when the history
/// changed. Re-applying with the same summary is a fixed point.
pub fn compact(messages: &mut Vec<ChatMessage>, keep_last: usize, summary: &str) -> bool {
    let prefix = messages.len().saturating_sub(keep_last);
    if prefix == 0 {
        return false;
    }
    let synthetic = ChatMessage {
        role: "user".into(),
        content: json!(format!("[Earlier conversation summarized]\n{}", summary)),
    };
    let tail: Vec<ChatMessage> = messages.drain(prefix..).collect();
    messages.clear();
    messages.push(synthetic);
    messages.extend(tail);
    true
}

// ── Content block helpers ────────────────────────────────────────────────

pub fn text_block(text: &str) -> Value {
    json!({ "type": "text", "text": text })
}

pub fn tool_use_block(id: &str, name: &str, input: &Value) -> Value {
    json!({ "type": "tool_use", "id": id, "name": name, "input": input })
}

pub fn tool_result_block(tool_use_id: &str, content: &str, is_error: bool) -> Value {
    let mut block = json!({
        "type": "tool_result",
        "tool_use_id": tool_use_id,
        "content": content,
    });
    if is_error {
        block["is_error"] = json!(true);
    }
    block
}

/// Turn a `data:<media>;base64,<payload>` URI into a typed image block.
/// Returns None for anything that isn't a well-formed data URI.
pub fn image_block(data_uri: &str) -> Option<Value> {
    use base64::Engine;

    let rest = data_uri.strip_prefix("data:")?;
    let (media_type, payload) = rest.split_once(";base64,")?;
    if media_type.is_empty() || payload.is_empty() {
        return None;
    }
    // Providers reject malformed base64 with an opaque 400; catch it here.
    if base64::engine::general_purpose::STANDARD
        .decode(payload)
        .is_err()
    {
        return None;
    }
    Some(json!({
        "type": "image",
        "source": {
            "type": "base64",
            "media_type": media_type,
            "data": payload,
        }
    }))
}
