//! Anthropic messages API streaming client.
//!
//! The native format: typed content blocks, `tool_use`/`tool_result`, and
//! optional extended-thinking deltas. Messages pass through unmodified since
//! blocks are already our canonical in-process shape.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ProviderError;
use super::sse::{data_payload, LineBuffer};
use super::{ChatRequest, Client, StreamEvent, ToolCall, Usage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub(crate) const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(base_url: &str) -> Self {
        let base = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        Self {
            base_url: base.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn build_body(req: &ChatRequest) -> Value {
        let max_tokens = if req.max_tokens > 0 {
            req.max_tokens
        } else {
            DEFAULT_MAX_TOKENS
        };
        let mut body = json!({
            "model": super::wire_model_code(&req.model),
            "max_tokens": max_tokens,
            "messages": req.messages,
            "stream": true,
        });
        if !req.system.is_empty() {
            // A cache-retention hint turns the system prompt into a block
            // carrying cache_control so the prefix is served from cache.
            if !req.cache_retention.is_empty() && req.cache_retention != "none" {
                body["system"] = json!([{
                    "type": "text",
                    "text": req.system,
                    "cache_control": { "type": "ephemeral" }
                }]);
            } else {
                body["system"] = json!(req.system);
            }
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl Client for AnthropicClient {
    async fn stream(
        &self,
        cancel: CancellationToken,
        req: &ChatRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamEvent>> {
        let (tx, rx) = mpsc::channel(32);

        let body = Self::build_body(req);
        let mut request = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", req.api_key.clone())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);
        if !req.beta_headers.is_empty() {
            request = request.header("anthropic-beta", req.beta_headers.join(","));
        }

        tokio::spawn(async move {
            let resp = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(StreamEvent::Error(ProviderError::network(&e))).await;
                    return;
                }
            };
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                let err =
                    ProviderError::from_status(status.as_u16(), &body).with_anthropic_hint();
                let _ = tx.send(StreamEvent::Error(err)).await;
                return;
            }

            let _ = tx.send(StreamEvent::Start).await;

            let mut stream = resp.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut parser = EventParser::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for line in lines.push(&bytes) {
                                let Some(data) = data_payload(&line) else { continue };
                                let Ok(v) = serde_json::from_str::<Value>(data) else {
                                    debug!("skipping malformed stream chunk");
                                    continue;
                                };
                                for ev in parser.parse(&v) {
                                    let terminal = matches!(
                                        ev,
                                        StreamEvent::Stop { .. } | StreamEvent::Error(_)
                                    );
                                    if tx.send(ev).await.is_err() || terminal {
                                        return;
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx
                                .send(StreamEvent::Error(ProviderError::network(&e)))
                                .await;
                            return;
                        }
                        None => break,
                    }
                }
            }

            // EOF without message_stop: still close with one terminal event.
            let _ = tx
                .send(StreamEvent::Stop {
                    reason: parser.stop_reason.unwrap_or_else(|| "end_turn".into()),
                })
                .await;
        });

        Ok(rx)
    }
}

/// Accumulating parser for the Anthropic event protocol. Tool-input JSON is
/// buffered per content-block index until `content_block_stop`.
#[derive(Default)]
struct EventParser {
    tools: HashMap<u64, PartialTool>,
    stop_reason: Option<String>,
}

#[derive(Default)]
struct PartialTool {
    id: String,
    name: String,
    args: String,
}

impl EventParser {
    fn parse(&mut self, v: &Value) -> Vec<StreamEvent> {
        let event_type = v["type"].as_str().unwrap_or("");
        match event_type {
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    self.tools.insert(
                        index,
                        PartialTool {
                            id: block["id"].as_str().unwrap_or("").to_string(),
                            name: block["name"].as_str().unwrap_or("").to_string(),
                            args: String::new(),
                        },
                    );
                }
                vec![]
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or("").to_string();
                        vec![StreamEvent::TextDelta(text)]
                    }
                    Some("thinking_delta") => {
                        let text = delta["thinking"].as_str().unwrap_or("").to_string();
                        vec![StreamEvent::ThinkingDelta(text)]
                    }
                    Some("input_json_delta") => {
                        let fragment = delta["partial_json"].as_str().unwrap_or("");
                        if let Some(t) = self.tools.get_mut(&index) {
                            t.args.push_str(fragment);
                        }
                        vec![StreamEvent::ToolDelta(fragment.to_string())]
                    }
                    _ => vec![],
                }
            }
            "content_block_stop" => {
                let index = v["index"].as_u64().unwrap_or(0);
                match self.tools.remove(&index) {
                    Some(t) => {
                        let input: Value = if t.args.trim().is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&t.args).unwrap_or_else(|_| json!({}))
                        };
                        vec![StreamEvent::ToolCall(ToolCall {
                            id: t.id,
                            name: t.name,
                            input,
                        })]
                    }
                    None => vec![],
                }
            }
            "message_delta" => {
                let mut out = Vec::new();
                if let Some(usage) = v.get("usage") {
                    let u = Usage {
                        input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                        output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                        cache_read_tokens: usage["cache_read_input_tokens"]
                            .as_u64()
                            .unwrap_or(0),
                        cache_write_tokens: usage["cache_creation_input_tokens"]
                            .as_u64()
                            .unwrap_or(0),
                    };
                    if u.input_tokens > 0 || u.output_tokens > 0 {
                        out.push(StreamEvent::Usage(u));
                    }
                }
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                out
            }
            "message_stop" => {
                vec![StreamEvent::Stop {
                    reason: self.stop_reason.take().unwrap_or_else(|| "end_turn".into()),
                }]
            }
            "error" => {
                let msg = v["error"]["message"].as_str().unwrap_or("unknown error");
                vec![StreamEvent::Error(ProviderError::message(msg))]
            }
            _ => vec![],
        }
    }
}
