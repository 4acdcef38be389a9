//! Hybrid vector + BM25 search over the per-agent memory tree.
//!
//! Memory is a directory of markdown under `workspace/memory/` (by
//! convention `core/`, `projects/`, `daily/`, `topics/`, plus `INDEX.md`
//! injected into the system prompt). The built index lives next to it as a
//! hidden binary file and is considered stale as soon as any `.md` file is
//! newer than it.

pub mod indexer;

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub const INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = ".search_index.bin";

/// A single indexed memory fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// Workspace-relative source path, e.g. "memory/core/knowledge.md".
    pub source: String,
    /// 1-indexed starting line in the source file.
    pub line: usize,
    /// Embedding vector; empty = BM25-only mode.
    #[serde(default)]
    pub vec: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SearchIndex {
    pub version: u32,
    pub indexed_at_ms: i64,
    pub chunks: Vec<Chunk>,
}

#[derive(Debug, Clone)]
pub struct MemoryTree {
    workspace_dir: PathBuf,
}

impl MemoryTree {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn mem_dir(&self) -> PathBuf {
        self.workspace_dir.join("memory")
    }

    fn index_path(&self) -> PathBuf {
        self.mem_dir().join(INDEX_FILE)
    }

    /// Read `memory/INDEX.md` (the lightweight system-prompt summary).
    pub fn read_index_md(&self) -> String {
        std::fs::read_to_string(self.mem_dir().join("INDEX.md")).unwrap_or_default()
    }

    /// Load the on-disk index. Missing, corrupt, or version-mismatched files
    /// all yield an empty index so the caller rebuilds.
    pub fn load_index(&self) -> SearchIndex {
        let data = match std::fs::read(self.index_path()) {
            Ok(d) => d,
            Err(_) => return SearchIndex::default(),
        };
        match bincode::deserialize::<SearchIndex>(&data) {
            Ok(idx) if idx.version == INDEX_VERSION => idx,
            _ => SearchIndex::default(),
        }
    }

    pub fn save_index(&self, idx: &SearchIndex) -> anyhow::Result<()> {
        let path = self.index_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let data = bincode::serialize(idx)?;
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// True when any `.md` under memory/ was modified after the index was
    /// built.
    pub fn is_stale(&self, idx: &SearchIndex) -> bool {
        if idx.indexed_at_ms == 0 {
            return true;
        }
        let cutoff = SystemTime::UNIX_EPOCH
            + std::time::Duration::from_millis(idx.indexed_at_ms.max(0) as u64);
        any_md_newer_than(&self.mem_dir(), cutoff)
    }
}

fn any_md_newer_than(dir: &Path, cutoff: SystemTime) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == INDEX_FILE {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            if any_md_newer_than(&path, cutoff) {
                return true;
            }
        } else if name.ends_with(".md") {
            if let Ok(meta) = entry.metadata() {
                if let Ok(mtime) = meta.modified() {
                    if mtime > cutoff {
                        return true;
                    }
                }
            }
        }
    }
    false
}

impl SearchIndex {
    /// Top-K retrieval. Cosine similarity when both the corpus and the query
    /// carry vectors, BM25 keyword scoring otherwise.
    pub fn search(&self, query_vec: Option<&[f32]>, query: &str, top_k: usize) -> Vec<Chunk> {
        if self.chunks.is_empty() {
            return Vec::new();
        }
        let top_k = if top_k == 0 { 5 } else { top_k };

        let has_vectors = self.chunks.iter().any(|c| !c.vec.is_empty());
        let mut scored: Vec<(f64, &Chunk)> = match query_vec {
            Some(qv) if has_vectors => self
                .chunks
                .iter()
                .filter(|c| !c.vec.is_empty())
                .map(|c| (cosine_sim(qv, &c.vec), c))
                .collect(),
            _ => {
                let terms = tokenize(query);
                if terms.is_empty() {
                    return self.chunks.iter().take(top_k).cloned().collect();
                }
                self.bm25_scores(&terms)
            }
        };

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(top_k)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn bm25_scores(&self, terms: &[String]) -> Vec<(f64, &Chunk)> {
        const K1: f64 = 1.5;
        const B: f64 = 0.75;

        let n = self.chunks.len() as f64;
        let lowered: Vec<String> = self
            .chunks
            .iter()
            .map(|c| c.text.to_lowercase())
            .collect();

        // Document frequency per term, substring-based so CJK text without
        // word boundaries still matches.
        let mut idf = Vec::with_capacity(terms.len());
        for term in terms {
            let df = lowered.iter().filter(|t| t.contains(term.as_str())).count();
            idf.push(if df > 0 {
                (1.0 + n / df as f64).ln()
            } else {
                0.0
            });
        }

        let doc_lens: Vec<f64> = self
            .chunks
            .iter()
            .map(|c| c.text.split_whitespace().count() as f64)
            .collect();
        let avgdl = (doc_lens.iter().sum::<f64>() / n).max(1.0);

        let mut scored = Vec::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            let dl = doc_lens[i];
            let mut score = 0.0;
            for (t, term) in terms.iter().enumerate() {
                let tf = lowered[i].matches(term.as_str()).count() as f64;
                if tf == 0.0 {
                    continue;
                }
                let tf_norm = tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * dl / avgdl));
                score += idf[t] * tf_norm;
            }
            if score > 0.0 {
                scored.push((score, chunk));
            }
        }
        scored
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (x, y) = (a[i] as f64, b[i] as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Lowercase and split a query into search terms. ASCII and CJK punctuation
/// becomes whitespace; single-character tokens are noise and dropped.
fn tokenize(s: &str) -> Vec<String> {
    let lowered = s.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| match c {
            ',' | '.' | '!' | '?' | ':' | ';' | '(' | ')' | '[' | ']' | '"' | '\'' => ' ',
            '，' | '。' | '！' | '？' | '：' | '；' | '、' | '（' | '）' | '「' | '」' | '【'
            | '】' => ' ',
            '\t' | '\n' | '\r' => ' ',
            c => c,
        })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_string())
        .collect()
}
