//! Shared headless browser for the browser_* tool family.
//!
//! One Chrome process serves every agent; each agent owns a disjoint list of
//! pages behind its own mutex, so agents can't touch each other's tabs. The
//! browser launches lazily on first use.

use std::collections::HashMap;
use std::sync::Arc;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::info;

pub struct Manager {
    browser: Mutex<Option<Browser>>,
    handler: Mutex<Option<tokio::task::JoinHandle<()>>>,
    agents: Mutex<HashMap<String, Arc<AgentPages>>>,
}

/// One agent's isolated tab list. `active` indexes into `pages`.
pub struct AgentPages {
    pub pages: Mutex<Vec<Page>>,
    pub active: Mutex<usize>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            browser: Mutex::new(None),
            handler: Mutex::new(None),
            agents: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_browser(&self) -> anyhow::Result<()> {
        let mut guard = self.browser.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let config = BrowserConfig::builder()
            .arg("--headless=new")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .build()
            .map_err(|e| anyhow::anyhow!("browser config: {}; is Chrome/Chromium installed?", e))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow::anyhow!("browser launch: {}", e))?;

        let handle = tokio::spawn(async move {
            while handler.next().await.is_some() {}
        });

        info!("headless browser launched");
        *guard = Some(browser);
        *self.handler.lock().await = Some(handle);
        Ok(())
    }

    async fn pages_for(&self, agent_id: &str) -> Arc<AgentPages> {
        let mut agents = self.agents.lock().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| {
                Arc::new(AgentPages {
                    pages: Mutex::new(Vec::new()),
                    active: Mutex::new(0),
                })
            })
            .clone()
    }

    /// Open a new tab for the agent and make it active. Returns its index.
    pub async fn new_page(&self, agent_id: &str, url: &str) -> anyhow::Result<usize> {
        self.ensure_browser().await?;
        let page = {
            let guard = self.browser.lock().await;
            let browser = guard.as_ref().expect("browser just ensured");
            browser
                .new_page(url)
                .await
                .map_err(|e| anyhow::anyhow!("new page: {}", e))?
        };
        let agent_pages = self.pages_for(agent_id).await;
        let mut pages = agent_pages.pages.lock().await;
        pages.push(page);
        let idx = pages.len() - 1;
        *agent_pages.active.lock().await = idx;
        Ok(idx)
    }

    /// The agent's active tab, creating a blank one if it has none.
    pub async fn active_page(&self, agent_id: &str) -> anyhow::Result<Page> {
        self.ensure_browser().await?;
        let agent_pages = self.pages_for(agent_id).await;
        {
            let pages = agent_pages.pages.lock().await;
            let active = *agent_pages.active.lock().await;
            if let Some(page) = pages.get(active) {
                return Ok(page.clone());
            }
        }
        let idx = self.new_page(agent_id, "about:blank").await?;
        let pages = agent_pages.pages.lock().await;
        Ok(pages[idx].clone())
    }

    /// (index, url, is_active) for each of the agent's tabs.
    pub async fn list_tabs(&self, agent_id: &str) -> Vec<(usize, String, bool)> {
        let agent_pages = self.pages_for(agent_id).await;
        let pages = agent_pages.pages.lock().await;
        let active = *agent_pages.active.lock().await;
        let mut out = Vec::with_capacity(pages.len());
        for (i, page) in pages.iter().enumerate() {
            let url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| "about:blank".to_string());
            out.push((i, url, i == active));
        }
        out
    }

    pub async fn switch_tab(&self, agent_id: &str, index: usize) -> anyhow::Result<()> {
        let agent_pages = self.pages_for(agent_id).await;
        let pages = agent_pages.pages.lock().await;
        if index >= pages.len() {
            anyhow::bail!("tab {} out of range (have {})", index, pages.len());
        }
        *agent_pages.active.lock().await = index;
        Ok(())
    }

    pub async fn close_tab(&self, agent_id: &str, index: usize) -> anyhow::Result<()> {
        let agent_pages = self.pages_for(agent_id).await;
        let mut pages = agent_pages.pages.lock().await;
        if index >= pages.len() {
            anyhow::bail!("tab {} out of range (have {})", index, pages.len());
        }
        let page = pages.remove(index);
        let _ = page.close().await;
        let mut active = agent_pages.active.lock().await;
        if *active >= pages.len() && !pages.is_empty() {
            *active = pages.len() - 1;
        }
        Ok(())
    }

    /// Shut the shared browser down (pool shutdown path).
    pub async fn close(&self) {
        if let Some(mut browser) = self.browser.lock().await.take() {
            let _ = browser.close().await;
        }
        if let Some(handle) = self.handler.lock().await.take() {
            handle.abort();
        }
        self.agents.lock().await.clear();
    }
}
