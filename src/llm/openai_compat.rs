//! Shared OpenAI-compatible chat/completions streaming client.
//!
//! One base implementation serves OpenAI, DeepSeek, Moonshot/Kimi,
//! Zhipu/GLM, MiniMax, Qwen/DashScope, OpenRouter, and self-hosted
//! endpoints. Per-provider differences are injected: a delta-parse hook
//! (DeepSeek `reasoning_content`) and extra request headers (OpenRouter
//! caller identification).
//!
//! Translation from the canonical block format happens here:
//! - assistant `tool_use` block → `tool_calls` array entry on an assistant
//!   message whose `content` is an empty string, never null — several
//!   providers silently drop null-content messages and then reject the
//!   following `tool` messages as dangling;
//! - user `tool_result` block → one `role:"tool"` message per result with
//!   `tool_call_id`.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::ProviderError;
use super::sse::{data_payload, LineBuffer};
use super::{ChatMessage, ChatRequest, Client, StreamEvent, ToolCall, Usage};

/// Hook consulted for each streamed delta object before default parsing.
type DeltaHook = fn(&Value) -> Option<StreamEvent>;

pub struct OpenAiCompatClient {
    base_url: String,
    extra_headers: Vec<(&'static str, String)>,
    delta_hook: Option<DeltaHook>,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    fn new(default_base: &str, base_url: &str) -> Self {
        let base = if base_url.is_empty() {
            default_base
        } else {
            base_url
        };
        Self {
            base_url: base.trim_end_matches('/').to_string(),
            extra_headers: Vec::new(),
            delta_hook: None,
            http: reqwest::Client::new(),
        }
    }

    pub fn openai(base_url: &str) -> Self {
        Self::new("https://api.openai.com/v1", base_url)
    }

    pub fn deepseek(base_url: &str) -> Self {
        let mut c = Self::new("https://api.deepseek.com", base_url);
        c.delta_hook = Some(deepseek_reasoning_hook);
        c
    }

    pub fn moonshot(base_url: &str) -> Self {
        Self::new("https://api.moonshot.cn/v1", base_url)
    }

    pub fn zhipu(base_url: &str) -> Self {
        Self::new("https://open.bigmodel.cn/api/paas/v4", base_url)
    }

    pub fn minimax(base_url: &str) -> Self {
        Self::new("https://api.minimax.chat/v1", base_url)
    }

    pub fn qwen(base_url: &str) -> Self {
        Self::new("https://dashscope.aliyuncs.com/compatible-mode/v1", base_url)
    }

    pub fn openrouter(base_url: &str) -> Self {
        let mut c = Self::new("https://openrouter.ai/api/v1", base_url);
        c.extra_headers = vec![
            ("HTTP-Referer", "https://github.com/aihive/aihive".to_string()),
            ("X-Title", "aihive".to_string()),
        ];
        c
    }

    /// Self-hosted / unknown providers: the configured base URL is used
    /// verbatim.
    pub fn custom(base_url: &str) -> Self {
        Self::new(base_url, base_url)
    }

    fn build_body(req: &ChatRequest) -> Value {
        let mut body = json!({
            "model": super::wire_model_code(&req.model),
            "messages": translate_messages(&req.system, &req.messages),
            "stream": true,
        });
        if req.max_tokens > 0 {
            body["max_tokens"] = json!(req.max_tokens);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl Client for OpenAiCompatClient {
    async fn stream(
        &self,
        cancel: CancellationToken,
        req: &ChatRequest,
    ) -> anyhow::Result<mpsc::Receiver<StreamEvent>> {
        let (tx, rx) = mpsc::channel(32);

        let body = Self::build_body(req);
        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", req.api_key))
            .json(&body);
        for (name, value) in &self.extra_headers {
            request = request.header(*name, value.clone());
        }
        let delta_hook = self.delta_hook;

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
                let _ = tx
                    .send(StreamEvent::Error(ProviderError::from_status(
                        status.as_u16(),
                        &body,
                    )))
                    .await;
                return;
            }

            let _ = tx.send(StreamEvent::Start).await;

            let mut stream = resp.bytes_stream();
            let mut lines = LineBuffer::new();
            let mut parser = CompatParser::new(delta_hook);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    chunk = stream.next() => match chunk {
                        Some(Ok(bytes)) => {
                            for line in lines.push(&bytes) {
                                let Some(data) = data_payload(&line) else { continue };
                                if data == "[DONE]" {
                                    for ev in parser.finish() {
                                        let _ = tx.send(ev).await;
                                    }
                                    return;
                                }
                                let Ok(v) = serde_json::from_str::<Value>(data) else {
                                    debug!("skipping malformed stream chunk");
                                    continue;
                                };
                                for ev in parser.parse(&v) {
                                    let terminal = matches!(ev, StreamEvent::Error(_));
                                    if tx.send(ev).await.is_err() || terminal {
                                        return;
                                    }
                                }
                            }
                        }
                        // Scanner errors at EOF are swallowed; anything else
                        // surfaces as the terminal event.
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

            // Stream ended without [DONE]; flush and close with Stop anyway.
            for ev in parser.finish() {
                let _ = tx.send(ev).await;
            }
        });

        Ok(rx)
    }
}

fn deepseek_reasoning_hook(delta: &Value) -> Option<StreamEvent> {
    let reasoning = delta["reasoning_content"].as_str()?;
    if reasoning.is_empty() {
        return None;
    }
    Some(StreamEvent::ThinkingDelta(reasoning.to_string()))
}

// ── Message translation ──────────────────────────────────────────────────

/// Translate canonical (Anthropic-style) history into chat/completions
/// messages.
fn translate_messages(system: &str, messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        out.push(json!({ "role": "system", "content": system }));
    }

    for msg in messages {
        let Some(blocks) = msg.content.as_array() else {
            out.push(json!({ "role": msg.role, "content": msg.content }));
            continue;
        };

        match msg.role.as_str() {
            "assistant" => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                for block in blocks {
                    match block["type"].as_str() {
                        Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                        Some("tool_use") => {
                            let args = serde_json::to_string(&block["input"])
                                .unwrap_or_else(|_| "{}".to_string());
                            tool_calls.push(json!({
                                "id": block["id"],
                                "type": "function",
                                "function": {
                                    "name": block["name"],
                                    "arguments": args,
                                }
                            }));
                        }
                        _ => {}
                    }
                }
                let mut m = json!({ "role": "assistant", "content": text });
                if !tool_calls.is_empty() {
                    m["tool_calls"] = json!(tool_calls);
                }
                out.push(m);
            }
            _ => {
                let mut text = String::new();
                for block in blocks {
                    match block["type"].as_str() {
                        Some("text") => text.push_str(block["text"].as_str().unwrap_or("")),
                        Some("tool_result") => {
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": block["tool_use_id"],
                                "content": tool_result_text(&block["content"]),
                            }));
                        }
                        // Image blocks have no chat/completions counterpart
                        // in this path.
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    out.push(json!({ "role": msg.role, "content": text }));
                }
            }
        }
    }
    out
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

// ── Streaming parse ──────────────────────────────────────────────────────

/// Accumulating parser for chat/completions deltas. Tool-call arguments are
/// buffered per stream index and flushed on `finish_reason=tool_calls` or
/// stream end.
struct CompatParser {
    tools: HashMap<u64, PartialTool>,
    order: Vec<u64>,
    stop_reason: Option<String>,
    delta_hook: Option<DeltaHook>,
}

#[derive(Default)]
struct PartialTool {
    id: String,
    name: String,
    args: String,
}

impl CompatParser {
    fn new(delta_hook: Option<DeltaHook>) -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            stop_reason: None,
            delta_hook,
        }
    }

    fn parse(&mut self, v: &Value) -> Vec<StreamEvent> {
        if let Some(err) = v.get("error") {
            let msg = err["message"].as_str().unwrap_or("unknown error");
            return vec![StreamEvent::Error(ProviderError::message(msg))];
        }

        let mut out = Vec::new();

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            let u = Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
                ..Default::default()
            };
            if u.input_tokens > 0 || u.output_tokens > 0 {
                out.push(StreamEvent::Usage(u));
            }
        }

        let Some(choice) = v["choices"].get(0) else {
            return out;
        };
        let delta = &choice["delta"];

        if let Some(hook) = self.delta_hook {
            if let Some(ev) = hook(delta) {
                out.push(ev);
            }
        }

        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                out.push(StreamEvent::TextDelta(content.to_string()));
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                if !self.tools.contains_key(&index) {
                    self.tools.insert(index, PartialTool::default());
                    self.order.push(index);
                }
                let partial = self.tools.get_mut(&index).expect("just inserted");
                if let Some(id) = tc["id"].as_str() {
                    if !id.is_empty() {
                        partial.id = id.to_string();
                    }
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    if !name.is_empty() {
                        partial.name = name.to_string();
                    }
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    partial.args.push_str(args);
                    if !args.is_empty() {
                        out.push(StreamEvent::ToolDelta(args.to_string()));
                    }
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.stop_reason = Some(reason.to_string());
            if reason == "tool_calls" {
                out.extend(self.flush_tools());
            }
        }

        out
    }

    fn flush_tools(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for index in std::mem::take(&mut self.order) {
            let Some(t) = self.tools.remove(&index) else {
                continue;
            };
            if t.name.is_empty() {
                continue;
            }
            let input: Value = if t.args.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&t.args).unwrap_or_else(|_| json!({}))
            };
            out.push(StreamEvent::ToolCall(ToolCall {
                id: t.id,
                name: t.name,
                input,
            }));
        }
        out
    }

    /// Flush pending tool calls and emit the terminal Stop event.
    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = self.flush_tools();
        out.push(StreamEvent::Stop {
            reason: self.stop_reason.take().unwrap_or_else(|| "stop".into()),
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_tool_use_translates_to_tool_calls_with_empty_content() {
        let messages = vec![ChatMessage {
            role: "assistant".into(),
            content: json!([
                {"type": "tool_use", "id": "tu_1", "name": "read",
                 "input": {"path": "a.txt"}}
            ]),
        }];
        let out = translate_messages("", &messages);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "assistant");
        // Must be "" not null: providers drop null-content messages.
        assert_eq!(out[0]["content"], "");
        assert_eq!(out[0]["tool_calls"][0]["id"], "tu_1");
        assert_eq!(out[0]["tool_calls"][0]["function"]["name"], "read");
        let args: Value =
            serde_json::from_str(out[0]["tool_calls"][0]["function"]["arguments"].as_str().unwrap())
                .unwrap();
        assert_eq!(args["path"], "a.txt");
    }

    #[test]
    fn user_tool_results_become_tool_messages() {
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: json!([
                {"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"},
                {"type": "tool_result", "tool_use_id": "tu_2",
                 "content": [{"type": "text", "text": "also ok"}]}
            ]),
        }];
        let out = translate_messages("", &messages);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["role"], "tool");
        assert_eq!(out[0]["tool_call_id"], "tu_1");
        assert_eq!(out[0]["content"], "ok");
        assert_eq!(out[1]["tool_call_id"], "tu_2");
        assert_eq!(out[1]["content"], "also ok");
    }

    #[test]
    fn system_prompt_leads_and_strings_pass_through() {
        let messages = vec![ChatMessage {
            role: "user".into(),
            content: json!("hello"),
        }];
        let out = translate_messages("be brief", &messages);
        assert_eq!(out[0]["role"], "system");
        assert_eq!(out[0]["content"], "be brief");
        assert_eq!(out[1]["role"], "user");
        assert_eq!(out[1]["content"], "hello");
    }

    #[test]
    fn parser_accumulates_tool_args_and_flushes_on_finish_reason() {
        let mut p = CompatParser::new(None);
        p.parse(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1",
                 "function": {"name": "exec", "arguments": "{\"cmd\":"}}
            ]}}]
        }));
        p.parse(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"ls\"}"}}
            ]}}]
        }));
        let evs = p.parse(&json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}]
        }));
        let calls: Vec<_> = evs
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "exec");
        assert_eq!(calls[0].input["cmd"], "ls");
    }

    #[test]
    fn parser_preserves_multi_tool_order() {
        let mut p = CompatParser::new(None);
        p.parse(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "a", "function": {"name": "first", "arguments": "{}"}},
                {"index": 1, "id": "b", "function": {"name": "second", "arguments": "{}"}}
            ]}}]
        }));
        let evs = p.finish();
        let names: Vec<_> = evs
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ToolCall(c) => Some(c.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn finish_emits_stop_with_recorded_reason() {
        let mut p = CompatParser::new(None);
        p.parse(&json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}));
        let evs = p.finish();
        assert!(matches!(evs.last(), Some(StreamEvent::Stop { reason }) if reason == "stop"));
    }

    #[test]
    fn deepseek_hook_maps_reasoning_content() {
        let mut p = CompatParser::new(Some(deepseek_reasoning_hook));
        let evs = p.parse(&json!({
            "choices": [{"delta": {"reasoning_content": "thinking..."}}]
        }));
        assert!(matches!(&evs[0], StreamEvent::ThinkingDelta(t) if t == "thinking..."));
    }

    #[test]
    fn parser_surfaces_error_payload() {
        let mut p = CompatParser::new(None);
        let evs = p.parse(&json!({"error": {"message": "invalid model"}}));
        assert!(matches!(&evs[0], StreamEvent::Error(e) if e.message == "invalid model"));
    }

    #[test]
    fn usage_chunk_is_reported() {
        let mut p = CompatParser::new(None);
        let evs = p.parse(&json!({
            "choices": [],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7}
        }));
        assert!(
            matches!(&evs[0], StreamEvent::Usage(u) if u.input_tokens == 12 && u.output_tokens == 7)
        );
    }

    #[test]
    fn openrouter_carries_caller_headers() {
        let c = OpenAiCompatClient::openrouter("");
        assert_eq!(c.base_url, "https://openrouter.ai/api/v1");
        assert!(c.extra_headers.iter().any(|(k, _)| *k == "HTTP-Referer"));
        assert!(c.extra_headers.iter().any(|(k, _)| *k == "X-Title"));
    }

    #[test]
    fn base_url_override_trims_trailing_slash() {
        let c = OpenAiCompatClient::openai("https://proxy.example/v1/");
        assert_eq!(c.base_url, "https://proxy.example/v1");
    }
}
