//! `web_fetch` — bounded HTTP GET for the agent.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Tool;

const DEFAULT_MAX_BYTES: usize = 100 * 1024;
const HARD_MAX_BYTES: usize = 1024 * 1024;

pub struct WebFetchTool {
    http: reqwest::Client,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .user_agent("aihive/0.4")
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return the response body (bounded)."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http:// or https:// URL to fetch"
                },
                "max_bytes": {
                    "type": "integer",
                    "description": "Body size cap in bytes (default 102400)"
                }
            },
            "required": ["url"]
        })
    }

    async fn call(&self, cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        let url = args["url"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: url"))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("only http/https URLs are supported, got {:?}", url);
        }
        let max_bytes = args["max_bytes"]
            .as_u64()
            .map(|n| (n as usize).min(HARD_MAX_BYTES))
            .unwrap_or(DEFAULT_MAX_BYTES);

        let resp = tokio::select! {
            r = self.http.get(url).send() => r?,
            _ = cancel.cancelled() => anyhow::bail!("fetch cancelled"),
        };

        let status = resp.status();
        let body = tokio::select! {
            b = resp.text() => b?,
            _ = cancel.cancelled() => anyhow::bail!("fetch cancelled"),
        };

        if !status.is_success() {
            let snippet: String = body.chars().take(500).collect();
            anyhow::bail!("HTTP {}: {}", status.as_u16(), snippet);
        }

        let mut out = body;
        if out.len() > max_bytes {
            let mut end = max_bytes;
            while end > 0 && !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
            out.push_str("\n... (body truncated)");
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(args: Value) -> anyhow::Result<String> {
        WebFetchTool::new()
            .call(&CancellationToken::new(), &args.to_string())
            .await
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let err = run(json!({"url": "file:///etc/passwd"})).await.unwrap_err();
        assert!(err.to_string().contains("http/https"));
        let err = run(json!({"url": "ftp://example.com"})).await.unwrap_err();
        assert!(err.to_string().contains("http/https"));
    }

    #[tokio::test]
    async fn missing_url_is_rejected() {
        let err = run(json!({})).await.unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}
