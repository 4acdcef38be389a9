//! Provider-agnostic streaming LLM client layer.
//!
//! The canonical in-process message format is Anthropic-style typed content
//! blocks (string or block-array payloads carried as raw JSON). The
//! OpenAI-compatible adapters translate on the fly; see
//! [`openai_compat`] for the exact rules.

pub mod anthropic;
pub mod embed;
pub mod error;
pub mod openai_compat;
mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

pub use error::ProviderError;

/// Provider-agnostic chat request.
pub struct ChatRequest {
    /// Model tag in `provider/code` form; only the code goes on the wire.
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDef>,
    pub max_tokens: u32,
    pub api_key: String,
    /// Anthropic prompt-cache retention hint: "none" | "short" | "long".
    pub cache_retention: String,
    /// Extra `anthropic-beta` header values.
    pub beta_headers: Vec<String>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            system: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 0,
            api_key: String::new(),
            cache_retention: String::new(),
            beta_headers: Vec::new(),
        }
    }
}

impl Drop for ChatRequest {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

/// One turn of conversation history. `content` is either a JSON string or a
/// list of typed blocks (`text`, `tool_use`, `tool_result`, `image`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
}

/// A tool definition the model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A complete tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Token counts for one API call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// One item of the streaming response. Exactly one terminal event
/// ([`StreamEvent::Stop`] or [`StreamEvent::Error`]) arrives per stream
/// before the channel closes — except when the caller cancels, in which case
/// the channel closes silently.
#[derive(Debug)]
pub enum StreamEvent {
    Start,
    TextDelta(String),
    /// Reasoning text (Anthropic extended thinking, DeepSeek
    /// `reasoning_content`).
    ThinkingDelta(String),
    ToolCall(ToolCall),
    /// Partial tool-input JSON fragment.
    ToolDelta(String),
    Usage(Usage),
    Stop { reason: String },
    Error(ProviderError),
}

/// Provider-agnostic streaming client.
#[async_trait]
pub trait Client: Send + Sync {
    /// Send the request and stream response events. The returned channel is
    /// finite and non-restartable.
    async fn stream(
        &self,
        cancel: CancellationToken,
        req: &ChatRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamEvent>>;
}

/// Build the client for a provider tag. Unknown providers get the generic
/// OpenAI-compatible client (self-hosted endpoints).
pub fn new_client(provider: &str, base_url: &str) -> Arc<dyn Client> {
    match provider.to_ascii_lowercase().as_str() {
        "anthropic" => Arc::new(anthropic::AnthropicClient::new(base_url)),
        "openai" => Arc::new(openai_compat::OpenAiCompatClient::openai(base_url)),
        "deepseek" => Arc::new(openai_compat::OpenAiCompatClient::deepseek(base_url)),
        "moonshot" | "kimi" => Arc::new(openai_compat::OpenAiCompatClient::moonshot(base_url)),
        "zhipu" | "glm" => Arc::new(openai_compat::OpenAiCompatClient::zhipu(base_url)),
        "minimax" => Arc::new(openai_compat::OpenAiCompatClient::minimax(base_url)),
        "qwen" | "dashscope" => Arc::new(openai_compat::OpenAiCompatClient::qwen(base_url)),
        "openrouter" => Arc::new(openai_compat::OpenAiCompatClient::openrouter(base_url)),
        _ => Arc::new(openai_compat::OpenAiCompatClient::custom(base_url)),
    }
}

/// Strip the provider prefix from a model tag:
/// `deepseek/deepseek-chat` → `deepseek-chat`. Only the first segment is the
/// provider; OpenRouter codes legitimately contain further slashes.
pub fn wire_model_code(tag: &str) -> &str {
    match tag.find('/') {
        Some(idx) => &tag[idx + 1..],
        None => tag,
    }
}

/// Probe endpoint + headers for validating an API key against a provider.
/// Anthropic authenticates with `x-api-key`; everything else is a Bearer
/// token against the OpenAI-style models listing.
pub fn key_probe_request(provider: &str, base_url: &str) -> (String, &'static str) {
    match provider.to_ascii_lowercase().as_str() {
        "anthropic" => {
            let base = if base_url.is_empty() {
                "https://api.anthropic.com"
            } else {
                base_url
            };
            (
                format!("{}/v1/models", base.trim_end_matches('/')),
                "x-api-key",
            )
        }
        tag => {
            let default_base = match tag {
                "openai" => "https://api.openai.com/v1",
                "deepseek" => "https://api.deepseek.com",
                "moonshot" | "kimi" => "https://api.moonshot.cn/v1",
                "zhipu" | "glm" => "https://open.bigmodel.cn/api/paas/v4",
                "minimax" => "https://api.minimax.chat/v1",
                "qwen" | "dashscope" => "https://dashscope.aliyuncs.com/compatible-mode/v1",
                "openrouter" => "https://openrouter.ai/api/v1",
                _ => base_url,
            };
            let base = if base_url.is_empty() {
                default_base
            } else {
                base_url
            };
            (
                format!("{}/models", base.trim_end_matches('/')),
                "Authorization",
            )
        }
    }
}

/// Validate an API key against a provider with a bounded probe. Returns the
/// provider's error body on rejection.
pub async fn test_api_key(provider: &str, base_url: &str, api_key: &str) -> anyhow::Result<()> {
    let (url, header) = key_probe_request(provider, base_url);
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()?;
    let mut request = client.get(&url);
    request = if header == "x-api-key" {
        request
            .header("x-api-key", api_key)
            .header("anthropic-version", anthropic::API_VERSION)
    } else {
        request.header("Authorization", format!("Bearer {}", api_key))
    };
    let resp = request.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), &body).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_model_code_strips_prefix() {
        assert_eq!(wire_model_code("deepseek/deepseek-chat"), "deepseek-chat");
        assert_eq!(wire_model_code("claude-sonnet-4-5"), "claude-sonnet-4-5");
        assert_eq!(
            wire_model_code("openrouter/anthropic/claude-3.5"),
            "anthropic/claude-3.5"
        );
    }

    #[test]
    fn key_probe_targets_provider_endpoints() {
        let (url, header) = key_probe_request("anthropic", "");
        assert_eq!(url, "https://api.anthropic.com/v1/models");
        assert_eq!(header, "x-api-key");

        let (url, header) = key_probe_request("deepseek", "");
        assert_eq!(url, "https://api.deepseek.com/models");
        assert_eq!(header, "Authorization");

        let (url, _) = key_probe_request("openai", "https://proxy.example/v1/");
        assert_eq!(url, "https://proxy.example/v1/models");
    }
}
