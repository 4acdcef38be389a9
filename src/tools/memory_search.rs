//! `memory_search` — hybrid retrieval over the agent's memory tree.
//!
//! First use with no (or unreadable) index builds one synchronously. Every
//! use checks staleness and, when stale, kicks a background rebuild that
//! never blocks the query.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Tool;
use crate::llm::embed::Embedder;
use crate::memory::{indexer, MemoryTree};

const DEFAULT_TOP_K: usize = 5;
const MAX_TOP_K: usize = 20;

pub struct MemorySearchTool {
    tree: MemoryTree,
    embedder: Option<Embedder>,
    api_key: String,
}

impl MemorySearchTool {
    pub fn new(tree: MemoryTree, embedder: Option<Embedder>, api_key: String) -> Self {
        Self {
            tree,
            embedder,
            api_key,
        }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Search this agent's long-term memory. Returns the most relevant fragments \
         with their source file and line."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "top_k": {
                    "type": "integer",
                    "description": "Number of results (default 5, max 20)"
                }
            },
            "required": ["query"]
        })
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let query = args["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: query"))?;
        let top_k = args["top_k"]
            .as_u64()
            .map(|n| (n as usize).min(MAX_TOP_K))
            .unwrap_or(DEFAULT_TOP_K);

        let mut idx = self.tree.load_index();
        if idx.indexed_at_ms == 0 {
            // First lookup: build synchronously so the query has something
            // to run against.
            debug!("memory index missing, building synchronously");
            idx = indexer::build_index(&self.tree, self.embedder.as_ref(), &self.api_key).await?;
            self.tree.save_index(&idx)?;
        } else if self.tree.is_stale(&idx) {
            indexer::rebuild_if_stale(
                self.tree.clone(),
                self.embedder.clone(),
                self.api_key.clone(),
            );
        }

        // Query vector only when the corpus actually has vectors.
        let query_vec = match &self.embedder {
            Some(embedder) if idx.chunks.iter().any(|c| !c.vec.is_empty()) => {
                match embedder.embed(&self.api_key, &[query.to_string()]).await {
                    Ok(mut vecs) if !vecs.is_empty() => Some(vecs.remove(0)),
                    _ => None,
                }
            }
            _ => None,
        };

        let results = idx.search(query_vec.as_deref(), query, top_k);
        if results.is_empty() {
            return Ok("no matching memory found".to_string());
        }

        let mut out = String::new();
        for (i, chunk) in results.iter().enumerate() {
            out.push_str(&format!(
                "{}. {}:{}\n{}\n\n",
                i + 1,
                chunk.source,
                chunk.line,
                chunk.text
            ));
        }
        Ok(out.trim_end().to_string())
    }
}
