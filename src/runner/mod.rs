//! Per-turn execution core: system prompt → LLM stream → tool loop →
//! session persistence.

pub mod system_prompt;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::llm::{ChatMessage, ChatRequest, Client, StreamEvent, ToolCall};
use crate::session::{self, Store};
use crate::tools::Registry;

/// Hard cap on LLM round-trips within one turn.
const MAX_LOOP_ITERATIONS: usize = 20;

/// Events delivered to the caller of [`Runner::run`]. The stream always ends
/// with `Done`; an `Error` is followed by `Done`.
#[derive(Debug, Clone)]
pub enum RunEvent {
    TextDelta(String),
    Error(String),
    Done,
}

pub struct RunnerConfig {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    /// Model tag in `provider/code` form.
    pub model: String,
    pub api_key: String,
    /// Empty = ephemeral (no load, no save).
    pub session_id: String,
    pub parent_session_id: String,
    /// Media as data URIs, attached to the user message as image blocks.
    pub images: Vec<String>,
    pub project_context: String,
    pub cache_retention: String,
    pub max_tokens: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            workspace_dir: PathBuf::new(),
            model: String::new(),
            api_key: String::new(),
            session_id: String::new(),
            parent_session_id: String::new(),
            images: Vec::new(),
            project_context: String::new(),
            cache_retention: String::new(),
            max_tokens: 0,
        }
    }
}

pub struct Runner {
    cfg: RunnerConfig,
    llm: Arc<dyn Client>,
    tools: Arc<Registry>,
    session: Arc<Store>,
}

impl Runner {
    pub fn new(
        cfg: RunnerConfig,
        llm: Arc<dyn Client>,
        tools: Arc<Registry>,
        session: Arc<Store>,
    ) -> Self {
        Self {
            cfg,
            llm,
            tools,
            session,
        }
    }

    /// Drive one agent turn. The returned channel is finite; the caller's
    /// receive loop is safe to `while let` over.
    pub fn run(self, cancel: CancellationToken, message: String) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            self.run_inner(cancel, message, &tx).await;
            let _ = tx.send(RunEvent::Done).await;
        });
        rx
    }

    async fn run_inner(
        &self,
        cancel: CancellationToken,
        message: String,
        tx: &mpsc::Sender<RunEvent>,
    ) {
        let system = system_prompt::build(&self.cfg.workspace_dir, &self.cfg.project_context);

        let mut history = match self.session.load(&self.cfg.session_id).await {
            Ok(h) => h,
            Err(e) => {
                warn!(session = %self.cfg.session_id, "session load failed: {}", e);
                Vec::new()
            }
        };

        history.push(self.build_user_message(&message));
        self.persist(&history).await;

        for iteration in 0..MAX_LOOP_ITERATIONS {
            let req = ChatRequest {
                model: self.cfg.model.clone(),
                system: system.clone(),
                messages: history.clone(),
                tools: self.tools.definitions(),
                max_tokens: self.cfg.max_tokens,
                api_key: self.cfg.api_key.clone(),
                cache_retention: self.cfg.cache_retention.clone(),
                beta_headers: Vec::new(),
            };

            let mut stream = match self.llm.stream(cancel.clone(), &req).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx.send(RunEvent::Error(e.to_string())).await;
                    return;
                }
            };

            let mut assistant_text = String::new();
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut saw_terminal = false;

            while let Some(ev) = stream.recv().await {
                match ev {
                    StreamEvent::TextDelta(text) => {
                        assistant_text.push_str(&text);
                        let _ = tx.send(RunEvent::TextDelta(text)).await;
                    }
                    StreamEvent::ToolCall(call) => tool_calls.push(call),
                    StreamEvent::Error(e) => {
                        // Forward the failure, keep session state intact.
                        let _ = tx.send(RunEvent::Error(e.to_string())).await;
                        self.persist(&history).await;
                        return;
                    }
                    StreamEvent::Stop { reason } => {
                        debug!(iteration, %reason, "stream stopped");
                        saw_terminal = true;
                    }
                    StreamEvent::Start
                    | StreamEvent::ThinkingDelta(_)
                    | StreamEvent::ToolDelta(_)
                    | StreamEvent::Usage(_) => {}
                }
            }

            if !saw_terminal && cancel.is_cancelled() {
                // Cancelled mid-stream: drop the in-flight response, exit
                // cleanly.
                self.persist(&history).await;
                return;
            }

            if tool_calls.is_empty() {
                if !assistant_text.is_empty() {
                    history.push(ChatMessage {
                        role: "assistant".into(),
                        content: json!([session::text_block(&assistant_text)]),
                    });
                }
                self.persist(&history).await;
                return;
            }

            // Assistant message: text block (if any) followed by the
            // tool_use blocks in arrival order.
            let mut blocks = Vec::new();
            if !assistant_text.is_empty() {
                blocks.push(session::text_block(&assistant_text));
            }
            for call in &tool_calls {
                blocks.push(session::tool_use_block(&call.id, &call.name, &call.input));
            }
            history.push(ChatMessage {
                role: "assistant".into(),
                content: json!(blocks),
            });

            // Execute in arrival order; results land in one user message so
            // every tool_use is matched by a tool_result with the same id.
            let mut result_blocks = Vec::new();
            for call in &tool_calls {
                let input = call.input.to_string();
                let outcome = self.tools.execute(&cancel, &call.name, &input).await;
                if outcome.is_error {
                    debug!(tool = %call.name, "tool error: {}", outcome.body);
                }
                result_blocks.push(session::tool_result_block(
                    &call.id,
                    &outcome.body,
                    outcome.is_error,
                ));
            }
            history.push(ChatMessage {
                role: "user".into(),
                content: json!(result_blocks),
            });
            self.persist(&history).await;

            if cancel.is_cancelled() {
                return;
            }
        }

        let _ = tx
            .send(RunEvent::Error(format!(
                "tool loop exceeded {} iterations; aborting turn",
                MAX_LOOP_ITERATIONS
            )))
            .await;
    }

    fn build_user_message(&self, message: &str) -> ChatMessage {
        if self.cfg.images.is_empty() {
            return ChatMessage {
                role: "user".into(),
                content: json!(message),
            };
        }
        let mut blocks = Vec::new();
        for uri in &self.cfg.images {
            match session::image_block(uri) {
                Some(b) => blocks.push(b),
                None => warn!("skipping malformed image data URI"),
            }
        }
        blocks.push(session::text_block(message));
        ChatMessage {
            role: "user".into(),
            content: json!(blocks),
        }
    }

    async fn persist(&self, history: &[ChatMessage]) {
        if let Err(e) = self.session.save(&self.cfg.session_id, history).await {
            warn!(session = %self.cfg.session_id, "session save failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Scripted fake LLM: each call to stream() plays the next script.
    struct MockClient {
        scripts: Mutex<Vec<Vec<StreamEvent>>>,
    }

    impl MockClient {
        fn new(scripts: Vec<Vec<StreamEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts),
            })
        }
    }

    #[async_trait]
    impl Client for MockClient {
        async fn stream(
            &self,
            _cancel: CancellationToken,
            _req: &ChatRequest,
        ) -> anyhow::Result<mpsc::Receiver<StreamEvent>> {
            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.is_empty() {
                vec![StreamEvent::Stop {
                    reason: "end_turn".into(),
                }]
            } else {
                scripts.remove(0)
            };
            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(async move {
                for ev in script {
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn tool_call(id: &str, name: &str, input: Value) -> StreamEvent {
        StreamEvent::ToolCall(ToolCall {
            id: id.into(),
            name: name.into(),
            input,
        })
    }

    struct Fixture {
        _workspace: tempfile::TempDir,
        _sessions: tempfile::TempDir,
        runner: Runner,
        store: Arc<Store>,
    }

    fn fixture(scripts: Vec<Vec<StreamEvent>>, session_id: &str) -> Fixture {
        let workspace = tempfile::tempdir().unwrap();
        let sessions = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(sessions.path()));
        let tools = Arc::new(Registry::new(workspace.path(), "main"));
        let runner = Runner::new(
            RunnerConfig {
                agent_id: "main".into(),
                workspace_dir: workspace.path().to_path_buf(),
                model: "anthropic/claude-sonnet-4-5".into(),
                api_key: "sk-test".into(),
                session_id: session_id.into(),
                ..Default::default()
            },
            MockClient::new(scripts),
            tools,
            store.clone(),
        );
        Fixture {
            _workspace: workspace,
            _sessions: sessions,
            runner,
            store,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn collect_text(events: &[RunEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn tool_loop_edits_file_and_leaves_well_formed_session() {
        let f = fixture(
            vec![
                vec![
                    StreamEvent::Start,
                    tool_call(
                        "tu_1",
                        "edit",
                        json!({"file_path": "note.txt", "old_string": "hello world",
                               "new_string": "hi world"}),
                    ),
                    StreamEvent::Stop {
                        reason: "tool_use".into(),
                    },
                ],
                vec![
                    StreamEvent::Start,
                    StreamEvent::TextDelta("Done — the file now says hi world.".into()),
                    StreamEvent::Stop {
                        reason: "end_turn".into(),
                    },
                ],
            ],
            "sess-1",
        );
        std::fs::write(
            f.runner.cfg.workspace_dir.join("note.txt"),
            "hello world",
        )
        .unwrap();

        let events = drain(f.runner.run(
            CancellationToken::new(),
            "Change 'hello world' to 'hi world' in note.txt, then confirm.".into(),
        ))
        .await;

        assert!(collect_text(&events).contains("hi world"));
        assert!(matches!(events.last(), Some(RunEvent::Done)));
        assert!(!events.iter().any(|e| matches!(e, RunEvent::Error(_))));

        let history = f.store.load("sess-1").await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
        assert_eq!(history[1].content[0]["type"], "tool_use");
        assert_eq!(history[2].role, "user");
        assert_eq!(history[2].content[0]["type"], "tool_result");
        assert_eq!(history[2].content[0]["tool_use_id"], "tu_1");
        assert!(history[2].content[0].get("is_error").is_none());
        assert_eq!(history[3].role, "assistant");
    }

    #[tokio::test]
    async fn unknown_tool_recovers_and_session_stays_well_formed() {
        let f = fixture(
            vec![
                vec![
                    StreamEvent::Start,
                    tool_call("tu_9", "quantum_solve", json!({})),
                    StreamEvent::Stop {
                        reason: "tool_use".into(),
                    },
                ],
                vec![
                    StreamEvent::Start,
                    StreamEvent::TextDelta("Sorry, that tool does not exist.".into()),
                    StreamEvent::Stop {
                        reason: "end_turn".into(),
                    },
                ],
            ],
            "sess-2",
        );

        let events = drain(
            f.runner
                .run(CancellationToken::new(), "use the quantum solver".into()),
        )
        .await;
        assert!(!events.iter().any(|e| matches!(e, RunEvent::Error(_))));

        let history = f.store.load("sess-2").await.unwrap();
        let result = &history[2].content[0];
        assert_eq!(result["is_error"], json!(true));
        let body = result["content"].as_str().unwrap();
        assert!(body.starts_with("[quantum_solve] unknown tool; available tools: "));
        assert!(body.contains("read"));
    }

    #[tokio::test]
    async fn every_tool_use_is_matched_by_a_result() {
        let f = fixture(
            vec![
                vec![
                    tool_call("tu_a", "glob", json!({"pattern": "*.txt"})),
                    tool_call("tu_b", "exec", json!({"command": "echo ok"})),
                    StreamEvent::Stop {
                        reason: "tool_use".into(),
                    },
                ],
                vec![
                    StreamEvent::TextDelta("done".into()),
                    StreamEvent::Stop {
                        reason: "end_turn".into(),
                    },
                ],
            ],
            "sess-3",
        );
        drain(f.runner.run(CancellationToken::new(), "go".into())).await;

        let history = f.store.load("sess-3").await.unwrap();
        let uses: Vec<String> = history
            .iter()
            .filter(|m| m.role == "assistant")
            .flat_map(|m| m.content.as_array().cloned().unwrap_or_default())
            .filter(|b| b["type"] == "tool_use")
            .map(|b| b["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(uses, vec!["tu_a", "tu_b"]);

        for (i, m) in history.iter().enumerate() {
            let Some(blocks) = m.content.as_array() else { continue };
            let use_ids: Vec<&str> = blocks
                .iter()
                .filter(|b| b["type"] == "tool_use")
                .map(|b| b["id"].as_str().unwrap())
                .collect();
            if use_ids.is_empty() {
                continue;
            }
            let next = history.get(i + 1).expect("tool_use must have a next message");
            assert_eq!(next.role, "user");
            let result_ids: Vec<&str> = next
                .content
                .as_array()
                .unwrap()
                .iter()
                .filter(|b| b["type"] == "tool_result")
                .map(|b| b["tool_use_id"].as_str().unwrap())
                .collect();
            assert_eq!(use_ids, result_ids);
        }
    }

    #[tokio::test]
    async fn llm_error_is_forwarded_then_done() {
        let f = fixture(
            vec![vec![
                StreamEvent::Start,
                StreamEvent::Error(ProviderError::from_status(500, "boom")),
            ]],
            "sess-4",
        );
        let events = drain(f.runner.run(CancellationToken::new(), "hi".into())).await;
        assert!(matches!(&events[0], RunEvent::Error(e) if e.contains("500")));
        assert!(matches!(events.last(), Some(RunEvent::Done)));

        // User message was persisted before the stream.
        let history = f.store.load("sess-4").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "user");
    }

    #[tokio::test]
    async fn runaway_loop_is_capped() {
        let scripts: Vec<Vec<StreamEvent>> = (0..MAX_LOOP_ITERATIONS + 1)
            .map(|i| {
                vec![
                    tool_call(
                        &format!("tu_{}", i),
                        "glob",
                        json!({"pattern": "*.none"}),
                    ),
                    StreamEvent::Stop {
                        reason: "tool_use".into(),
                    },
                ]
            })
            .collect();
        let f = fixture(scripts, "");
        let events = drain(f.runner.run(CancellationToken::new(), "loop forever".into())).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, RunEvent::Error(msg) if msg.contains("exceeded"))));
        assert!(matches!(events.last(), Some(RunEvent::Done)));
    }

    #[tokio::test]
    async fn ephemeral_session_writes_nothing() {
        let f = fixture(
            vec![vec![
                StreamEvent::TextDelta("hi".into()),
                StreamEvent::Stop {
                    reason: "end_turn".into(),
                },
            ]],
            "",
        );
        let session_dir = f.store.session_dir().clone();
        drain(f.runner.run(CancellationToken::new(), "hello".into())).await;
        let entries: Vec<_> = std::fs::read_dir(&session_dir)
            .map(|r| r.flatten().collect())
            .unwrap_or_default();
        assert!(entries.is_empty());
    }
}
