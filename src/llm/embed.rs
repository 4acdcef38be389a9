//! Embedding client for OpenAI-compatible `/v1/embeddings` endpoints.
//!
//! Known providers: openai, zhipu, minimax. Any custom base URL is assumed
//! OpenAI-compatible. Providers without embedding support yield no embedder
//! and memory search degrades to BM25.

use serde::Deserialize;
use tracing::debug;

struct ProviderSpec {
    default_base_url: &'static str,
    model: &'static str,
}

fn known_spec(provider: &str) -> Option<ProviderSpec> {
    match provider {
        "openai" => Some(ProviderSpec {
            default_base_url: "https://api.openai.com/v1",
            model: "text-embedding-3-small",
        }),
        "zhipu" => Some(ProviderSpec {
            default_base_url: "https://open.bigmodel.cn/api/paas/v4",
            model: "embedding-2",
        }),
        "minimax" => Some(ProviderSpec {
            default_base_url: "https://api.minimax.chat/v1",
            model: "embo-01",
        }),
        _ => None,
    }
}

/// True when the provider has a known embeddings endpoint.
pub fn supports_embedding(provider: &str) -> bool {
    known_spec(provider).is_some()
}

#[derive(Clone)]
pub struct Embedder {
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl Embedder {
    /// Build an embedder for a provider. `base_url` overrides the provider
    /// default; unknown providers require one (else None).
    pub fn new(provider: &str, base_url: &str) -> Option<Self> {
        let spec = known_spec(provider);
        if spec.is_none() && base_url.is_empty() {
            return None;
        }
        let effective = if base_url.is_empty() {
            spec.as_ref().map(|s| s.default_base_url).unwrap_or("")
        } else {
            base_url
        };
        let model = spec
            .map(|s| s.model)
            .unwrap_or("text-embedding-3-small")
            .to_string();
        Some(Self {
            base_url: normalize_base_url(effective),
            model,
            http: reqwest::Client::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a batch of texts; output order matches input order.
    pub async fn embed(&self, api_key: &str, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(2048).collect();
            anyhow::bail!("embed API {}: {}", status.as_u16(), snippet);
        }

        #[derive(Deserialize)]
        struct EmbedData {
            index: usize,
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct EmbedResponse {
            data: Vec<EmbedData>,
        }

        let parsed: EmbedResponse = resp.json().await?;
        debug!(count = parsed.data.len(), model = %self.model, "embedded batch");

        let mut vecs = vec![Vec::new(); texts.len()];
        for d in parsed.data {
            if d.index < vecs.len() {
                vecs[d.index] = d.embedding;
            }
        }
        Ok(vecs)
    }
}

/// Strip trailing slashes and ensure a versioned path suffix, without
/// double-adding when the URL already carries one.
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let tail = &trimmed[trimmed.len().saturating_sub(20)..];
    if tail.contains("/v1") || tail.contains("/v4") {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_providers_supported() {
        assert!(supports_embedding("openai"));
        assert!(supports_embedding("zhipu"));
        assert!(supports_embedding("minimax"));
        assert!(!supports_embedding("anthropic"));
        assert!(!supports_embedding("deepseek"));
    }

    #[test]
    fn unknown_provider_without_base_url_yields_none() {
        assert!(Embedder::new("anthropic", "").is_none());
        assert!(Embedder::new("somevendor", "https://llm.example").is_some());
    }

    #[test]
    fn default_base_urls_and_models() {
        let e = Embedder::new("openai", "").unwrap();
        assert_eq!(e.base_url, "https://api.openai.com/v1");
        assert_eq!(e.model(), "text-embedding-3-small");

        let e = Embedder::new("zhipu", "").unwrap();
        assert_eq!(e.base_url, "https://open.bigmodel.cn/api/paas/v4");
        assert_eq!(e.model(), "embedding-2");
    }

    #[test]
    fn normalize_appends_v1_once() {
        assert_eq!(normalize_base_url("https://x.example"), "https://x.example/v1");
        assert_eq!(normalize_base_url("https://x.example/v1/"), "https://x.example/v1");
        assert_eq!(
            normalize_base_url("https://open.bigmodel.cn/api/paas/v4"),
            "https://open.bigmodel.cn/api/paas/v4"
        );
    }
}
