//! Chunks memory markdown and (optionally) embeds it.

use std::path::Path;

use chrono::Utc;
use tracing::{info, warn};

use super::{Chunk, MemoryTree, SearchIndex, INDEX_VERSION};
use crate::llm::embed::Embedder;

/// Soft byte cap per chunk; oversized paragraphs are force-split.
const MAX_CHUNK_BYTES: usize = 600;
/// Fragments shorter than this are noise and dropped.
const MIN_CHUNK_BYTES: usize = 20;
const EMBED_BATCH_SIZE: usize = 64;

/// Scan the memory tree, chunk every `.md` file, and embed when an embedder
/// is available. Any embedding failure silently degrades to BM25-only — the
/// index is still written.
pub async fn build_index(
    tree: &MemoryTree,
    embedder: Option<&Embedder>,
    api_key: &str,
) -> anyhow::Result<SearchIndex> {
    let mut chunks = chunk_all_files(tree);

    if let Some(embedder) = embedder {
        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            match batch_embed(embedder, api_key, &texts).await {
                Ok(vecs) => {
                    for (chunk, vec) in chunks.iter_mut().zip(vecs) {
                        chunk.vec = vec;
                    }
                }
                Err(e) => {
                    warn!("embedding failed, falling back to BM25: {}", e);
                }
            }
        }
    }

    Ok(SearchIndex {
        version: INDEX_VERSION,
        indexed_at_ms: Utc::now().timestamp_millis(),
        chunks,
    })
}

/// Check staleness and rebuild in the background when needed. Never blocks
/// the caller's query path.
pub fn rebuild_if_stale(tree: MemoryTree, embedder: Option<Embedder>, api_key: String) {
    tokio::spawn(async move {
        let idx = tree.load_index();
        if !tree.is_stale(&idx) {
            return;
        }
        match build_index(&tree, embedder.as_ref(), &api_key).await {
            Ok(new_idx) => {
                let mode = if new_idx.chunks.iter().any(|c| !c.vec.is_empty()) {
                    embedder.as_ref().map(|e| e.model().to_string())
                } else {
                    None
                };
                if let Err(e) = tree.save_index(&new_idx) {
                    warn!("memory index save failed: {}", e);
                    return;
                }
                info!(
                    chunks = new_idx.chunks.len(),
                    mode = mode.as_deref().unwrap_or("bm25"),
                    "memory index rebuilt"
                );
            }
            Err(e) => warn!("memory index rebuild failed: {}", e),
        }
    });
}

/// Walk memory/ depth-first and chunk every visible `.md` file.
fn chunk_all_files(tree: &MemoryTree) -> Vec<Chunk> {
    let mem_dir = tree.mem_dir();
    let mut chunks = Vec::new();
    walk_md(&mem_dir, tree.workspace_dir(), &mut chunks);
    chunks
}

fn walk_md(dir: &Path, workspace: &Path, out: &mut Vec<Chunk>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        let path = entry.path();
        if path.is_dir() {
            walk_md(&path, workspace, out);
            continue;
        }
        if name.starts_with('.') || !name.ends_with(".md") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue; // best-effort
        };
        let rel = path
            .strip_prefix(workspace)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        out.extend(split_into_chunks(&content, &rel));
    }
}

/// Split file content into paragraph-sized chunks delimited by blank lines.
fn split_into_chunks(content: &str, source: &str) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut start_line = 1usize;

    let mut flush = |buf: &mut String, start_line: &mut usize, next_line: usize| {
        let text = buf.trim();
        if text.len() >= MIN_CHUNK_BYTES {
            chunks.push(Chunk {
                text: text.to_string(),
                source: source.to_string(),
                line: *start_line,
                vec: Vec::new(),
            });
        }
        buf.clear();
        *start_line = next_line;
    };

    for (i, line) in content.lines().enumerate() {
        let line_num = i + 1;
        if line.trim().is_empty() {
            if !buf.is_empty() {
                flush(&mut buf, &mut start_line, line_num + 1);
            } else {
                start_line = line_num + 1;
            }
        } else {
            if buf.is_empty() {
                start_line = line_num;
            }
            buf.push_str(line);
            buf.push('\n');
            if buf.len() >= MAX_CHUNK_BYTES {
                flush(&mut buf, &mut start_line, line_num + 1);
            }
        }
    }
    if !buf.is_empty() {
        let total = content.lines().count();
        flush(&mut buf, &mut start_line, total);
    }
    chunks
}

async fn batch_embed(
    embedder: &Embedder,
    api_key: &str,
    texts: &[String],
) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut all = Vec::with_capacity(texts.len());
    for batch in texts.chunks(EMBED_BATCH_SIZE) {
        let vecs = embedder.embed(api_key, batch).await?;
        all.extend(vecs);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_split_on_blank_lines_with_line_numbers() {
        let content = "first paragraph with enough text\n\nsecond paragraph also long enough\n";
        let chunks = split_into_chunks(content, "memory/core/a.md");
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].line, 1);
        assert_eq!(chunks[1].line, 3);
        assert_eq!(chunks[0].source, "memory/core/a.md");
    }

    #[test]
    fn short_fragments_are_dropped() {
        let chunks = split_into_chunks("tiny\n\nthis one is comfortably long enough\n", "m.md");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("comfortably"));
    }

    #[test]
    fn oversized_paragraph_is_force_split() {
        let long_line = "x".repeat(250);
        let content = format!("{}\n{}\n{}\n{}\n", long_line, long_line, long_line, long_line);
        let chunks = split_into_chunks(&content, "m.md");
        assert!(chunks.len() >= 2, "expected force split, got {}", chunks.len());
        for c in &chunks {
            assert!(c.text.len() <= MAX_CHUNK_BYTES + 260);
        }
    }

    #[tokio::test]
    async fn build_index_without_embedder_is_bm25_only() {
        let dir = tempfile::tempdir().unwrap();
        let tree = MemoryTree::new(dir.path());
        std::fs::create_dir_all(tree.mem_dir().join("core")).unwrap();
        std::fs::write(
            tree.mem_dir().join("core/prefs.md"),
            "用户偏好早餐：豆浆和油条，周末喜欢吃包子。\n\nuser also likes strong coffee in the morning\n",
        )
        .unwrap();
        // Hidden and non-md files are skipped.
        std::fs::write(tree.mem_dir().join(".hidden.md"), "skip me entirely").unwrap();
        std::fs::write(tree.mem_dir().join("notes.txt"), "skip me too please").unwrap();

        let idx = build_index(&tree, None, "").await.unwrap();
        assert_eq!(idx.version, INDEX_VERSION);
        assert!(idx.indexed_at_ms > 0);
        assert_eq!(idx.chunks.len(), 2);
        assert!(idx.chunks.iter().all(|c| c.vec.is_empty()));
        assert!(idx.chunks[0].source.starts_with("memory/"));

        let results = idx.search(None, "用户偏好早餐", 5);
        assert!(!results.is_empty());
        assert!(results[0].text.contains("早餐"));
    }
}
