//! Agent pool: per-invocation composition of model, credentials, tools,
//! session store, and runner.
//!
//! Every run builds a fresh tool registry and runner so concurrent turns
//! never share mutable state. The pool also provides the run-function
//! adapters that plug the runner into the subagent manager and the cron
//! engine.

use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agents::{self, Agent};
use crate::broadcast::Broadcasters;
use crate::config::{Config, ModelEntry};
use crate::cron;
use crate::llm::{self, embed::Embedder};
use crate::memory::MemoryTree;
use crate::runner::{RunEvent, Runner, RunnerConfig};
use crate::session::Store;
use crate::subagent;
use crate::tools::Registry;

pub struct Pool {
    config: Arc<RwLock<Config>>,
    agents: Arc<agents::Manager>,
    broadcasters: Broadcasters,
    subagent_mgr: RwLock<Option<Arc<subagent::Manager>>>,
    /// One chatlog manager per workspace so each workspace has exactly one
    /// index mutex.
    chatlogs: RwLock<std::collections::HashMap<String, Arc<crate::chatlog::Chatlog>>>,
    #[cfg(feature = "browser")]
    browser: Arc<crate::browser::Manager>,
}

impl Pool {
    pub fn new(config: Arc<RwLock<Config>>, agents: Arc<agents::Manager>) -> Self {
        Self {
            config,
            agents,
            broadcasters: Broadcasters::new(),
            subagent_mgr: RwLock::new(None),
            chatlogs: RwLock::new(std::collections::HashMap::new()),
            #[cfg(feature = "browser")]
            browser: Arc::new(crate::browser::Manager::new()),
        }
    }

    /// The chatlog manager for an agent's workspace. The channel layer
    /// appends each user/assistant exchange here so the agent can look up
    /// past conversations.
    pub fn chatlog(&self, agent_id: &str) -> anyhow::Result<Arc<crate::chatlog::Chatlog>> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| anyhow::anyhow!("agent {:?} not found", agent_id))?;
        {
            let logs = self.chatlogs.read().expect("chatlogs lock");
            if let Some(log) = logs.get(agent_id) {
                return Ok(Arc::clone(log));
            }
        }
        let log = Arc::new(crate::chatlog::Chatlog::new(&agent.workspace_dir));
        self.chatlogs
            .write()
            .expect("chatlogs lock")
            .insert(agent_id.to_string(), Arc::clone(&log));
        Ok(log)
    }

    pub fn broadcasters(&self) -> Broadcasters {
        self.broadcasters.clone()
    }

    pub fn set_subagent_manager(&self, mgr: Arc<subagent::Manager>) {
        *self.subagent_mgr.write().expect("subagent lock") = Some(mgr);
    }

    /// Resolve the model entry for an agent. The `__config__` system agent
    /// always follows the current default so it never goes stale.
    pub fn resolve_model(&self, agent: &Agent) -> anyhow::Result<ModelEntry> {
        let config = self.config.read().expect("config lock");
        if agent.system && agent.id == agents::CONFIG_AGENT_ID {
            return config
                .default_model()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no model configured"));
        }
        if !agent.model_id.is_empty() {
            if let Some(m) = config.find_model(&agent.model_id) {
                return Ok(m.clone());
            }
        }
        config
            .default_model()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no model configured"))
    }

    /// First configured provider with embeddings support; memory search
    /// degrades to BM25 when none exists.
    fn resolve_embedder(&self) -> (Option<Embedder>, String) {
        let config = self.config.read().expect("config lock");
        for provider in &config.providers {
            if provider.api_key.is_empty() {
                continue;
            }
            if !llm::embed::supports_embedding(&provider.provider) {
                continue;
            }
            if let Some(embedder) = Embedder::new(&provider.provider, &provider.base_url) {
                return (Some(embedder), provider.api_key.clone());
            }
        }
        (None, String::new())
    }

    /// Assemble the per-turn registry with every applicable middleware.
    fn build_registry(&self, agent: &Agent, session_id: &str, parent_session_id: &str) -> Registry {
        let mut reg = Registry::new(&agent.workspace_dir, &agent.id);

        if !agent.env.is_empty() {
            reg = reg.with_env(agent.env.clone());
        }

        let agents_mgr = Arc::clone(&self.agents);
        let agent_id = agent.id.clone();
        reg = reg.with_env_updater(Arc::new(move |key, value| {
            agents_mgr.set_env_var(&agent_id, key, value)
        }));

        let agents_mgr = Arc::clone(&self.agents);
        let agent_id = agent.id.clone();
        reg = reg.with_agent_renamer(Arc::new(move |name| agents_mgr.rename(&agent_id, name)));

        if let Some(mgr) = self.subagent_mgr.read().expect("subagent lock").clone() {
            reg = reg.with_subagent_manager(mgr, session_id);
        }

        if !parent_session_id.is_empty() {
            reg = reg.with_parent_session(
                parent_session_id,
                self.broadcasters.clone(),
                &agent.id,
                &agent.name,
                &agent.avatar_color,
            );
        }

        let (embedder, embed_key) = self.resolve_embedder();
        reg = reg.with_memory_search(MemoryTree::new(&agent.workspace_dir), embedder, embed_key);

        #[cfg(feature = "browser")]
        {
            reg = reg.with_browser(Arc::clone(&self.browser));
        }

        reg
    }

    /// Run one turn, streaming events. `parent_session_id` is non-empty only
    /// when this run is driven as a subagent.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_stream(
        &self,
        cancel: CancellationToken,
        agent_id: &str,
        message: &str,
        session_id: &str,
        parent_session_id: &str,
        images: Vec<String>,
        model_override: &str,
    ) -> anyhow::Result<mpsc::Receiver<RunEvent>> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| anyhow::anyhow!("agent {:?} not found", agent_id))?;

        let model_entry = self.resolve_model(&agent)?;
        let (api_key, base_url) = {
            let config = self.config.read().expect("config lock");
            config.resolve_credentials(&model_entry)?
        };
        if api_key.is_empty() {
            anyhow::bail!(
                "no API key configured for model {:?}",
                model_entry.provider_model()
            );
        }

        let model_tag = if model_override.is_empty() {
            model_entry.provider_model()
        } else if model_override.contains('/') {
            model_override.to_string()
        } else {
            format!("{}/{}", model_entry.provider, model_override)
        };

        let client = llm::new_client(&model_entry.provider, &base_url);
        let registry = Arc::new(self.build_registry(&agent, session_id, parent_session_id));

        // Subagent turns get their own store directory so their isolated
        // sessions never mix with interactive history.
        let store = if session_id.starts_with("subagent-") {
            Store::new(agent.session_dir.join("subagent"))
        } else {
            Store::new(&agent.session_dir)
        };

        let runner = Runner::new(
            RunnerConfig {
                agent_id: agent.id.clone(),
                workspace_dir: agent.workspace_dir.clone(),
                model: model_tag,
                api_key,
                session_id: session_id.to_string(),
                parent_session_id: parent_session_id.to_string(),
                images,
                project_context: String::new(),
                cache_retention: String::new(),
                max_tokens: 0,
            },
            client,
            registry,
            Arc::new(store),
        );

        Ok(runner.run(cancel, message.to_string()))
    }

    /// Run one turn and collect the full text response.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        agent_id: &str,
        message: &str,
        session_id: &str,
    ) -> anyhow::Result<String> {
        let mut rx = self
            .run_stream(cancel, agent_id, message, session_id, "", Vec::new(), "")
            .await?;
        let mut text = String::new();
        while let Some(ev) = rx.recv().await {
            match ev {
                RunEvent::TextDelta(t) => text.push_str(&t),
                RunEvent::Error(e) => anyhow::bail!("{}", e),
                RunEvent::Done => {}
            }
        }
        Ok(text)
    }

    /// Adapter: lets the subagent manager drive runs through this pool.
    pub fn subagent_run_fn(pool: Arc<Pool>) -> subagent::RunFunc {
        Arc::new(move |cancel: CancellationToken, req: subagent::RunRequest| {
            let (tx, rx) = mpsc::channel(32);
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let stream = pool
                    .run_stream(
                        cancel,
                        &req.agent_id,
                        &req.task,
                        &req.session_id,
                        &req.parent_session_id,
                        Vec::new(),
                        &req.model,
                    )
                    .await;
                match stream {
                    Ok(mut events) => {
                        while let Some(ev) = events.recv().await {
                            if tx.send(ev).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(agent = %req.agent_id, "subagent run setup failed: {}", e);
                        let _ = tx.send(RunEvent::Error(e.to_string())).await;
                        let _ = tx.send(RunEvent::Done).await;
                    }
                }
            });
            rx
        })
    }

    /// Adapter: cron runs execute in a fresh `cron-{job}-{run}` session and
    /// return the collected text.
    pub fn cron_run_fn(pool: Arc<Pool>) -> cron::CronRunFn {
        Arc::new(move |cancel: CancellationToken, args: cron::RunArgs| {
            let pool = Arc::clone(&pool);
            Box::pin(async move {
                let session_id = format!("cron-{}-{}", args.job_id, args.run_id);
                let mut rx = pool
                    .run_stream(
                        cancel,
                        &args.agent_id,
                        &args.message,
                        &session_id,
                        "",
                        Vec::new(),
                        &args.model,
                    )
                    .await?;
                let mut text = String::new();
                while let Some(ev) = rx.recv().await {
                    match ev {
                        RunEvent::TextDelta(t) => text.push_str(&t),
                        RunEvent::Error(e) => anyhow::bail!("{}", e),
                        RunEvent::Done => {}
                    }
                }
                Ok(text)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderEntry;

    fn test_config() -> Arc<RwLock<Config>> {
        let mut cfg = Config::default();
        cfg.providers.push(ProviderEntry {
            id: "p1".into(),
            provider: "deepseek".into(),
            api_key: "sk-test".into(),
            ..Default::default()
        });
        cfg.models.push(ModelEntry {
            id: "m-default".into(),
            provider: "deepseek".into(),
            model: "deepseek-chat".into(),
            default: true,
            supports_tools: true,
            provider_id: "p1".into(),
            ..Default::default()
        });
        cfg.models.push(ModelEntry {
            id: "m-alt".into(),
            provider: "deepseek".into(),
            model: "deepseek-reasoner".into(),
            supports_tools: true,
            provider_id: "p1".into(),
            ..Default::default()
        });
        Arc::new(RwLock::new(cfg))
    }

    fn pool() -> (Arc<Pool>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let agents = Arc::new(
            agents::Manager::new(dir.path().join("data"), dir.path().join("ws")).unwrap(),
        );
        let pool = Arc::new(Pool::new(test_config(), agents));
        (pool, dir)
    }

    #[tokio::test]
    async fn model_resolution_prefers_agent_override_then_default() {
        let (pool, _dir) = pool();
        let agent = pool.agents.get("main").unwrap();
        assert_eq!(pool.resolve_model(&agent).unwrap().id, "m-default");

        pool.agents.set_model("main", "m-alt").unwrap();
        let agent = pool.agents.get("main").unwrap();
        assert_eq!(pool.resolve_model(&agent).unwrap().id, "m-alt");

        // Dangling reference falls back to the default.
        pool.agents.set_model("main", "m-gone").unwrap();
        let agent = pool.agents.get("main").unwrap();
        assert_eq!(pool.resolve_model(&agent).unwrap().id, "m-default");
    }

    #[tokio::test]
    async fn config_agent_always_uses_default_model() {
        let (pool, _dir) = pool();
        let agent = pool.agents.get(agents::CONFIG_AGENT_ID).unwrap();
        assert_eq!(pool.resolve_model(&agent).unwrap().id, "m-default");
    }

    #[tokio::test]
    async fn registry_wiring_includes_optional_tools() {
        let (pool, _dir) = pool();
        let agent = pool.agents.get("main").unwrap();

        let reg = pool.build_registry(&agent, "sess-1", "");
        let names = reg.names();
        assert!(names.contains(&"memory_search".to_string()));
        assert!(names.contains(&"agent_spawn".to_string()));
        assert!(!names.contains(&"report_to_parent".to_string()));

        let reg = pool.build_registry(&agent, "subagent-x", "sess-parent");
        assert!(reg.names().contains(&"report_to_parent".to_string()));
    }

    #[tokio::test]
    async fn env_updater_round_trips_through_agents() {
        let (pool, _dir) = pool();
        let agent = pool.agents.get("main").unwrap();
        let reg = pool.build_registry(&agent, "s", "");
        let cancel = CancellationToken::new();

        let out = reg
            .execute(
                &cancel,
                "self_set_env",
                &serde_json::json!({"key": "FOO", "value": "bar"}).to_string(),
            )
            .await;
        assert!(!out.is_error, "{}", out.body);
        assert_eq!(
            pool.agents.get("main").unwrap().env.get("FOO"),
            Some(&"bar".to_string())
        );
    }

    #[tokio::test]
    async fn unknown_agent_is_a_clean_error() {
        let (pool, _dir) = pool();
        let err = pool
            .run_stream(
                CancellationToken::new(),
                "ghost",
                "hi",
                "s",
                "",
                Vec::new(),
                "",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected_before_the_wire() {
        let (pool, _dir) = pool();
        pool.config.write().unwrap().providers[0].api_key.clear();
        let err = pool
            .run_stream(
                CancellationToken::new(),
                "main",
                "hi",
                "s",
                "",
                Vec::new(),
                "",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    #[tokio::test]
    async fn chatlog_is_shared_per_workspace() {
        let (pool, _dir) = pool();
        let a = pool.chatlog("main").unwrap();
        let b = pool.chatlog("main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.append(crate::chatlog::Entry {
            session_id: "s".into(),
            channel_id: "web".into(),
            channel_type: "web".into(),
            role: "user".into(),
            content: "hello".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(b.entries().len(), 1);
        assert!(pool.chatlog("ghost").is_err());
    }

    #[tokio::test]
    async fn embedder_resolution_picks_embedding_capable_provider() {
        let (pool, _dir) = pool();
        // deepseek has no embeddings endpoint.
        assert!(pool.resolve_embedder().0.is_none());

        pool.config.write().unwrap().providers.push(ProviderEntry {
            id: "p2".into(),
            provider: "zhipu".into(),
            api_key: "sk-z".into(),
            ..Default::default()
        });
        let (embedder, key) = pool.resolve_embedder();
        assert!(embedder.is_some());
        assert_eq!(key, "sk-z");
    }
}
