//! The browser_* tool family. Sixteen thin tools over the shared headless
//! browser; each agent sees only its own tabs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::Tool;
use crate::browser::Manager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Navigate,
    Snapshot,
    Click,
    Type,
    Fill,
    Press,
    Hover,
    Scroll,
    Select,
    Eval,
    Wait,
    Tabs,
    NewTab,
    SwitchTab,
    CloseTab,
    Screenshot,
}

const ALL_ACTIONS: [Action; 16] = [
    Action::Navigate,
    Action::Snapshot,
    Action::Click,
    Action::Type,
    Action::Fill,
    Action::Press,
    Action::Hover,
    Action::Scroll,
    Action::Select,
    Action::Eval,
    Action::Wait,
    Action::Tabs,
    Action::NewTab,
    Action::SwitchTab,
    Action::CloseTab,
    Action::Screenshot,
];

pub fn tools(
    manager: Arc<Manager>,
    agent_id: &str,
    workspace_dir: PathBuf,
) -> Vec<Arc<dyn Tool>> {
    ALL_ACTIONS
        .iter()
        .map(|&action| {
            Arc::new(BrowserTool {
                manager: Arc::clone(&manager),
                agent_id: agent_id.to_string(),
                workspace_dir: workspace_dir.clone(),
                action,
            }) as Arc<dyn Tool>
        })
        .collect()
}

struct BrowserTool {
    manager: Arc<Manager>,
    agent_id: String,
    workspace_dir: PathBuf,
    action: Action,
}

fn selector_schema(extra: Value) -> Value {
    let mut props = json!({
        "selector": { "type": "string", "description": "CSS selector" }
    });
    if let (Some(base), Some(more)) = (props.as_object_mut(), extra.as_object()) {
        for (k, v) in more {
            base.insert(k.clone(), v.clone());
        }
    }
    json!({ "type": "object", "properties": props, "required": ["selector"] })
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        match self.action {
            Action::Navigate => "browser_navigate",
            Action::Snapshot => "browser_snapshot",
            Action::Click => "browser_click",
            Action::Type => "browser_type",
            Action::Fill => "browser_fill",
            Action::Press => "browser_press",
            Action::Hover => "browser_hover",
            Action::Scroll => "browser_scroll",
            Action::Select => "browser_select",
            Action::Eval => "browser_eval",
            Action::Wait => "browser_wait",
            Action::Tabs => "browser_tabs",
            Action::NewTab => "browser_new_tab",
            Action::SwitchTab => "browser_switch_tab",
            Action::CloseTab => "browser_close_tab",
            Action::Screenshot => "browser_screenshot",
        }
    }

    fn description(&self) -> &str {
        match self.action {
            Action::Navigate => "Open a URL in the active browser tab.",
            Action::Snapshot => "Text snapshot of the active page (title, url, visible text).",
            Action::Click => "Click an element by CSS selector.",
            Action::Type => "Type text into an element (appends to existing content).",
            Action::Fill => "Replace an input's content with the given value.",
            Action::Press => "Press a keyboard key on an element (e.g. Enter).",
            Action::Hover => "Hover the mouse over an element.",
            Action::Scroll => "Scroll the page by a pixel delta.",
            Action::Select => "Choose an option of a <select> element by value.",
            Action::Eval => "Evaluate a JavaScript expression on the page.",
            Action::Wait => "Wait for a selector to appear (or a fixed delay).",
            Action::Tabs => "List this agent's browser tabs.",
            Action::NewTab => "Open a new tab, optionally at a URL.",
            Action::SwitchTab => "Make another tab active by index.",
            Action::CloseTab => "Close a tab by index.",
            Action::Screenshot => "Screenshot the active page to a file in the workspace.",
        }
    }

    fn schema(&self) -> Value {
        match self.action {
            Action::Navigate => json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
            Action::Snapshot | Action::Tabs | Action::Screenshot => {
                json!({ "type": "object", "properties": {} })
            }
            Action::Click | Action::Hover => selector_schema(json!({})),
            Action::Type | Action::Fill => selector_schema(json!({
                "text": { "type": "string", "description": "Text to enter" }
            })),
            Action::Press => selector_schema(json!({
                "key": { "type": "string", "description": "Key name, e.g. Enter, Tab" }
            })),
            Action::Select => selector_schema(json!({
                "value": { "type": "string", "description": "Option value to select" }
            })),
            Action::Scroll => json!({
                "type": "object",
                "properties": {
                    "dx": { "type": "integer" },
                    "dy": { "type": "integer" }
                }
            }),
            Action::Eval => json!({
                "type": "object",
                "properties": { "expression": { "type": "string" } },
                "required": ["expression"]
            }),
            Action::Wait => json!({
                "type": "object",
                "properties": {
                    "selector": { "type": "string" },
                    "timeout_ms": { "type": "integer", "description": "Default 5000" }
                }
            }),
            Action::NewTab => json!({
                "type": "object",
                "properties": { "url": { "type": "string" } }
            }),
            Action::SwitchTab | Action::CloseTab => json!({
                "type": "object",
                "properties": { "index": { "type": "integer" } },
                "required": ["index"]
            }),
        }
    }

    async fn call(&self, _cancel: &CancellationToken, arguments: &str) -> anyhow::Result<String> {
        let args: Value = serde_json::from_str(arguments)?;
        match self.action {
            Action::Navigate => self.navigate(&args).await,
            Action::Snapshot => self.snapshot().await,
            Action::Click => self.click(&args).await,
            Action::Type => self.type_text(&args, false).await,
            Action::Fill => self.type_text(&args, true).await,
            Action::Press => self.press(&args).await,
            Action::Hover => self.hover(&args).await,
            Action::Scroll => self.scroll(&args).await,
            Action::Select => self.select(&args).await,
            Action::Eval => self.eval(&args).await,
            Action::Wait => self.wait(&args).await,
            Action::Tabs => self.tabs().await,
            Action::NewTab => self.new_tab(&args).await,
            Action::SwitchTab => self.switch_tab(&args).await,
            Action::CloseTab => self.close_tab(&args).await,
            Action::Screenshot => self.screenshot().await,
        }
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing required parameter: {}", key))
}

impl BrowserTool {
    async fn navigate(&self, args: &Value) -> anyhow::Result<String> {
        let url = required_str(args, "url")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        page.goto(url)
            .await
            .map_err(|e| anyhow::anyhow!("navigate to {:?}: {}", url, e))?;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        Ok(format!("navigated to {}", url))
    }

    async fn snapshot(&self) -> anyhow::Result<String> {
        let page = self.manager.active_page(&self.agent_id).await?;
        let url = page.url().await.ok().flatten().unwrap_or_default();
        let title = page
            .evaluate("document.title")
            .await
            .ok()
            .and_then(|r| r.into_value::<String>().ok())
            .unwrap_or_default();
        let text = page
            .evaluate("document.body ? document.body.innerText : ''")
            .await
            .map_err(|e| anyhow::anyhow!("snapshot: {}", e))?
            .into_value::<String>()
            .unwrap_or_default();
        let mut text = text;
        if text.len() > 20_000 {
            let mut end = 20_000;
            while end > 0 && !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
            text.push_str("\n... (snapshot truncated)");
        }
        Ok(format!("{}\n{}\n\n{}", title, url, text))
    }

    async fn click(&self, args: &Value) -> anyhow::Result<String> {
        let selector = required_str(args, "selector")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("element not found {:?}: {}", selector, e))?;
        element
            .click()
            .await
            .map_err(|e| anyhow::anyhow!("click {:?}: {}", selector, e))?;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        Ok(format!("clicked {:?}", selector))
    }

    async fn type_text(&self, args: &Value, clear_first: bool) -> anyhow::Result<String> {
        let selector = required_str(args, "selector")?;
        let text = required_str(args, "text")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        let element = page
            .find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("element not found {:?}: {}", selector, e))?;
        element
            .click()
            .await
            .map_err(|e| anyhow::anyhow!("focus {:?}: {}", selector, e))?;
        if clear_first {
            let js = format!(
                "document.querySelector('{}').value = ''",
                selector.replace('\'', "\\'")
            );
            let _ = page.evaluate(js).await;
        }
        element
            .type_str(text)
            .await
            .map_err(|e| anyhow::anyhow!("type into {:?}: {}", selector, e))?;
        Ok(format!("entered text into {:?}", selector))
    }

    async fn press(&self, args: &Value) -> anyhow::Result<String> {
        let selector = required_str(args, "selector")?;
        let key = required_str(args, "key")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        page.find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("element not found {:?}: {}", selector, e))?;
        let js = format!(
            "var el = document.querySelector('{sel}'); el.focus(); \
             for (var t of ['keydown','keypress','keyup']) \
               el.dispatchEvent(new KeyboardEvent(t, {{ key: '{key}', bubbles: true }}));",
            sel = selector.replace('\'', "\\'"),
            key = key.replace('\'', "\\'")
        );
        page.evaluate(js)
            .await
            .map_err(|e| anyhow::anyhow!("press {:?} on {:?}: {}", key, selector, e))?;
        Ok(format!("pressed {:?} on {:?}", key, selector))
    }

    async fn hover(&self, args: &Value) -> anyhow::Result<String> {
        let selector = required_str(args, "selector")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        page.find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("element not found {:?}: {}", selector, e))?;
        let js = format!(
            "var el = document.querySelector('{sel}'); el.scrollIntoView(); \
             el.dispatchEvent(new MouseEvent('mouseover', {{ bubbles: true }})); \
             el.dispatchEvent(new MouseEvent('mouseenter', {{ bubbles: true }}));",
            sel = selector.replace('\'', "\\'")
        );
        page.evaluate(js)
            .await
            .map_err(|e| anyhow::anyhow!("hover {:?}: {}", selector, e))?;
        Ok(format!("hovering {:?}", selector))
    }

    async fn scroll(&self, args: &Value) -> anyhow::Result<String> {
        let dx = args["dx"].as_i64().unwrap_or(0);
        let dy = args["dy"].as_i64().unwrap_or(600);
        let page = self.manager.active_page(&self.agent_id).await?;
        page.evaluate(format!("window.scrollBy({}, {})", dx, dy))
            .await
            .map_err(|e| anyhow::anyhow!("scroll: {}", e))?;
        Ok(format!("scrolled by ({}, {})", dx, dy))
    }

    async fn select(&self, args: &Value) -> anyhow::Result<String> {
        let selector = required_str(args, "selector")?;
        let value = required_str(args, "value")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        page.find_element(selector)
            .await
            .map_err(|e| anyhow::anyhow!("element not found {:?}: {}", selector, e))?;
        let js = format!(
            "var el = document.querySelector('{}'); el.value = '{}'; \
             el.dispatchEvent(new Event('change', {{ bubbles: true }}));",
            selector.replace('\'', "\\'"),
            value.replace('\'', "\\'")
        );
        page.evaluate(js)
            .await
            .map_err(|e| anyhow::anyhow!("select on {:?}: {}", selector, e))?;
        Ok(format!("selected {:?} in {:?}", value, selector))
    }

    async fn eval(&self, args: &Value) -> anyhow::Result<String> {
        let expression = required_str(args, "expression")?;
        let page = self.manager.active_page(&self.agent_id).await?;
        let result = page
            .evaluate(expression)
            .await
            .map_err(|e| anyhow::anyhow!("eval: {}", e))?;
        let value: Value = result.into_value().unwrap_or(Value::Null);
        Ok(value.to_string())
    }

    async fn wait(&self, args: &Value) -> anyhow::Result<String> {
        let timeout_ms = args["timeout_ms"].as_u64().unwrap_or(5000);
        let Some(selector) = args["selector"].as_str() else {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            return Ok(format!("waited {}ms", timeout_ms));
        };
        let page = self.manager.active_page(&self.agent_id).await?;
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            if page.find_element(selector).await.is_ok() {
                return Ok(format!("{:?} appeared", selector));
            }
            if std::time::Instant::now() >= deadline {
                anyhow::bail!("timed out after {}ms waiting for {:?}", timeout_ms, selector);
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    async fn tabs(&self) -> anyhow::Result<String> {
        let tabs = self.manager.list_tabs(&self.agent_id).await;
        if tabs.is_empty() {
            return Ok("no open tabs".to_string());
        }
        Ok(tabs
            .into_iter()
            .map(|(i, url, active)| {
                format!("{}{} {}", if active { "*" } else { " " }, i, url)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn new_tab(&self, args: &Value) -> anyhow::Result<String> {
        let url = args["url"].as_str().unwrap_or("about:blank");
        let idx = self.manager.new_page(&self.agent_id, url).await?;
        Ok(format!("opened tab {} at {}", idx, url))
    }

    async fn switch_tab(&self, args: &Value) -> anyhow::Result<String> {
        let index = args["index"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: index"))?
            as usize;
        self.manager.switch_tab(&self.agent_id, index).await?;
        Ok(format!("switched to tab {}", index))
    }

    async fn close_tab(&self, args: &Value) -> anyhow::Result<String> {
        let index = args["index"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("missing required parameter: index"))?
            as usize;
        self.manager.close_tab(&self.agent_id, index).await?;
        Ok(format!("closed tab {}", index))
    }

    async fn screenshot(&self) -> anyhow::Result<String> {
        let page = self.manager.active_page(&self.agent_id).await?;
        let bytes = page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("screenshot: {}", e))?;
        let dir = self.workspace_dir.join("screenshots");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!(
            "shot-{}.png",
            chrono::Utc::now().format("%Y%m%d-%H%M%S")
        ));
        std::fs::write(&path, bytes)?;
        Ok(format!("saved screenshot to {}", path.display()))
    }
}
