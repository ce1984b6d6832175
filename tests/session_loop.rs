//! 会话循环集成测试：脚本化后端 + 真实工具注册表

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use drone::config::AppConfig;
use drone::core::{Agent, AgentBuilder, AgentError, OutcomeKind, SessionRegistry};
use drone::llm::{LlmClient, LlmError, LlmResponse};
use drone::memory::{InMemoryLongTerm, LongTermMemory, Message, NoopLongTerm, Role, ToolCall};
use drone::react::{CancelStage, FramingTemplate};
use drone::tools::{Tool, ToolContext};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 按顺序回放固定回复，并记录每次收到的转录；脚本耗尽后重复 fallback
struct ScriptedLlm {
    script: Mutex<VecDeque<LlmResponse>>,
    fallback: LlmResponse,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlm {
    fn new(script: Vec<LlmResponse>, fallback: LlmResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        _cancel: &CancellationToken,
        transcript: &[Message],
        _tools: &[Arc<dyn Tool>],
    ) -> Result<LlmResponse, LlmError> {
        self.seen.lock().unwrap().push(transcript.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// 永不返回的后端（只等取消）
struct StuckLlm {
    entered: Arc<Notify>,
}

#[async_trait]
impl LlmClient for StuckLlm {
    async fn chat(
        &self,
        _cancel: &CancellationToken,
        _transcript: &[Message],
        _tools: &[Arc<dyn Tool>],
    ) -> Result<LlmResponse, LlmError> {
        self.entered.notify_one();
        std::future::pending::<Result<LlmResponse, LlmError>>().await
    }
}

/// 第一轮让会话通过 session_control 取消自己
struct SelfCancelLlm {
    registry: OnceLock<Arc<SessionRegistry>>,
}

#[async_trait]
impl LlmClient for SelfCancelLlm {
    async fn chat(
        &self,
        _cancel: &CancellationToken,
        transcript: &[Message],
        _tools: &[Arc<dyn Tool>],
    ) -> Result<LlmResponse, LlmError> {
        if transcript.iter().any(|m| m.role == Role::Tool) {
            return Ok(LlmResponse::text("still running after self-cancel"));
        }
        let own_id = self
            .registry
            .get()
            .and_then(|r| r.list().first().map(|s| s.id.clone()))
            .unwrap_or_default();
        Ok(LlmResponse::calls(vec![call(
            "call_1",
            "session_control",
            json!({"action": "cancel", "session_id": own_id}),
        )]))
    }
}

/// 进入后一直阻塞的工具
struct HangTool {
    entered: Arc<Notify>,
}

#[async_trait]
impl Tool for HangTool {
    fn name(&self) -> &str {
        "hang"
    }

    fn description(&self) -> &str {
        "Blocks forever."
    }

    async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<String, String> {
        self.entered.notify_one();
        std::future::pending::<Result<String, String>>().await
    }
}

fn call(id: &str, name: &str, args: Value) -> ToolCall {
    let arguments = match args {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    ToolCall::new(id, name, arguments)
}

fn config(dir: &TempDir) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.work_dir = Some(dir.path().to_path_buf());
    cfg.tasks.dir = dir.path().join("tasks");
    cfg.memory.path = None;
    cfg.tools.tool_timeout_secs = 30;
    cfg
}

fn build(cfg: AppConfig, llm: Arc<dyn LlmClient>) -> AgentBuilder {
    let framing = FramingTemplate::new("frame\n{tools}", std::path::Path::new("/work"), "standard");
    AgentBuilder::new(cfg)
        .with_llm(llm)
        .with_memory(Arc::new(NoopLongTerm))
        .with_framing(framing)
        .with_tasks(false)
}

#[tokio::test]
async fn test_list_files_answers_with_observation() {
    let dir = TempDir::new().unwrap();
    let listing = dir.path().join("listing");
    std::fs::create_dir(&listing).unwrap();
    std::fs::write(listing.join("alpha.txt"), "a").unwrap();
    std::fs::write(listing.join("beta.log"), "b").unwrap();

    let llm = ScriptedLlm::new(
        vec![
            LlmResponse::calls(vec![call(
                "c1",
                "fs_list",
                json!({"path": listing.display().to_string()}),
            )]),
            LlmResponse::text("There are 2 entries: alpha.txt and beta.log."),
        ],
        LlmResponse::text("unexpected"),
    );
    let agent = build(config(&dir), llm.clone()).build().unwrap();

    let outcome = agent
        .run(&CancellationToken::new(), "list files in the listing dir", vec![])
        .await
        .unwrap();

    assert_eq!(outcome.kind, OutcomeKind::Answered);
    assert!(outcome.text.starts_with(&format!("[{}]\n", outcome.session_id)));
    assert!(outcome.text.ends_with("alpha.txt and beta.log."));

    let seen = llm.seen();
    assert_eq!(seen.len(), 2);
    let observation = seen[1].last().unwrap();
    assert_eq!(observation.role, Role::Tool);
    assert_eq!(observation.tool_call_id.as_deref(), Some("c1"));
    assert!(observation.content.contains("alpha.txt"));
    assert!(observation.content.contains("beta.log"));
    assert!(agent.sessions().is_empty());
}

#[tokio::test]
async fn test_framing_refreshed_once_and_window_bounded() {
    let dir = TempDir::new().unwrap();
    let mut script: Vec<LlmResponse> = (0..8)
        .map(|i| {
            LlmResponse::calls(vec![call(
                &format!("c{i}"),
                "echo",
                json!({"text": format!("ping {i}")}),
            )])
        })
        .collect();
    script.push(LlmResponse::text("done"));
    let llm = ScriptedLlm::new(script, LlmResponse::text("unexpected"));

    let mut cfg = config(&dir);
    cfg.agent.context_window = 6;
    let agent = build(cfg, llm.clone()).build().unwrap();

    let outcome = agent.run(&CancellationToken::new(), "ping a lot", vec![]).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Answered);

    let seen = llm.seen();
    assert_eq!(seen.len(), 9);
    for transcript in &seen {
        assert!(transcript.len() <= 6, "window exceeded: {}", transcript.len());
        assert!(transcript[0].is_framing());
        assert_eq!(transcript.iter().filter(|m| m.is_framing()).count(), 1);
        assert!(transcript[0].content.contains("- echo: "));
    }
    // 最后一轮里最早的用户输入已被剪掉
    assert!(!seen[8].iter().any(|m| m.content == "ping a lot"));
}

#[tokio::test]
async fn test_step_budget_yields_loop_limit() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedLlm::new(
        vec![],
        LlmResponse::calls(vec![call("c", "echo", json!({"text": "again"}))]),
    );
    let mut cfg = config(&dir);
    cfg.agent.max_steps = 2;
    let agent = build(cfg, llm.clone()).build().unwrap();

    let outcome = agent.run(&CancellationToken::new(), "never ends", vec![]).await.unwrap();

    assert_eq!(outcome.kind, OutcomeKind::LoopLimit);
    assert!(outcome.text.contains(&outcome.session_id));
    assert!(outcome.text.contains("loop limit exceeded"));
    assert!(outcome.text.contains("2 steps"));
    assert_eq!(llm.seen().len(), 2);
    assert!(agent.sessions().is_empty());
}

#[tokio::test]
async fn test_capability_failure_is_observed_and_loop_continues() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedLlm::new(
        vec![
            LlmResponse::calls(vec![call("c1", "no_such_tool", json!({}))]),
            LlmResponse::calls(vec![call("c2", "echo", json!({"wrong": 1}))]),
            LlmResponse::text("recovered"),
        ],
        LlmResponse::text("unexpected"),
    );
    let agent = build(config(&dir), llm.clone()).build().unwrap();

    let outcome = agent.run(&CancellationToken::new(), "try things", vec![]).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Answered);

    let seen = llm.seen();
    let first_error = seen[1].last().unwrap();
    assert_eq!(first_error.role, Role::Tool);
    assert!(first_error.content.starts_with("ERROR: capability 'no_such_tool' is not registered"));
    let second_error = seen[2].last().unwrap();
    assert!(second_error.content.starts_with("ERROR: "));
    assert_eq!(second_error.tool_call_id.as_deref(), Some("c2"));
}

#[tokio::test]
async fn test_free_text_invocation_is_recovered() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedLlm::new(
        vec![
            LlmResponse::text("```json\n{\"function\": \"echo\", \"arguments\": {\"text\": \"hello\"}}\n```"),
            LlmResponse::text("echoed"),
        ],
        LlmResponse::text("unexpected"),
    );
    let agent = build(config(&dir), llm.clone()).build().unwrap();

    let outcome = agent.run(&CancellationToken::new(), "say hello", vec![]).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Answered);

    let seen = llm.seen();
    let observation = seen[1].last().unwrap();
    assert_eq!(observation.tool_call_id.as_deref(), Some("call_1"));
    assert!(observation.content.contains("hello"));
}

#[tokio::test]
async fn test_cancel_via_registry_interrupts_running_capability() {
    let dir = TempDir::new().unwrap();
    let entered = Arc::new(Notify::new());
    let llm = ScriptedLlm::new(
        vec![LlmResponse::calls(vec![call("c1", "hang", json!({}))])],
        LlmResponse::text("unexpected"),
    );
    let agent: Arc<Agent> = Arc::new(
        build(config(&dir), llm)
            .with_tool(Arc::new(HangTool {
                entered: Arc::clone(&entered),
            }))
            .build()
            .unwrap(),
    );

    let runner = {
        let agent = Arc::clone(&agent);
        tokio::spawn(async move { agent.run(&CancellationToken::new(), "block", vec![]).await })
    };
    entered.notified().await;

    let live = agent.sessions().list();
    assert_eq!(live.len(), 1);
    agent.sessions().cancel(&live[0].id).unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome.kind,
        OutcomeKind::Cancelled(CancelStage::Capability("hang".to_string()))
    );
    assert!(outcome.text.contains("cancelled"));
    assert!(agent.sessions().is_empty());
}

#[tokio::test]
async fn test_parent_cancel_interrupts_model_call() {
    let dir = TempDir::new().unwrap();
    let entered = Arc::new(Notify::new());
    let agent = Arc::new(
        build(
            config(&dir),
            Arc::new(StuckLlm {
                entered: Arc::clone(&entered),
            }),
        )
        .build()
        .unwrap(),
    );
    let root = CancellationToken::new();

    let runner = {
        let agent = Arc::clone(&agent);
        let root = root.clone();
        tokio::spawn(async move { agent.run(&root, "wait", vec![]).await })
    };
    entered.notified().await;
    root.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("session did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Cancelled(CancelStage::ModelCall));
    assert!(agent.sessions().is_empty());
}

#[tokio::test]
async fn test_session_can_cancel_itself_without_deadlock() {
    let dir = TempDir::new().unwrap();
    let llm = Arc::new(SelfCancelLlm {
        registry: OnceLock::new(),
    });
    let agent = build(config(&dir), llm.clone()).build().unwrap();
    let _ = llm.registry.set(Arc::clone(agent.sessions()));

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        agent.run(&CancellationToken::new(), "stop yourself", vec![]),
    )
    .await
    .expect("self-cancel deadlocked")
    .unwrap();

    assert_eq!(
        outcome.kind,
        OutcomeKind::Cancelled(CancelStage::Capability("session_control".to_string()))
    );
    assert!(agent.sessions().is_empty());
}

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let dir = TempDir::new().unwrap();
    let entered = Arc::new(Notify::new());
    let llm = ScriptedLlm::new(
        vec![LlmResponse::calls(vec![call("c1", "hang", json!({}))])],
        LlmResponse::text("quick answer"),
    );
    let agent = Arc::new(
        build(config(&dir), llm.clone())
            .with_tool(Arc::new(HangTool {
                entered: Arc::clone(&entered),
            }))
            .build()
            .unwrap(),
    );
    let root = CancellationToken::new();

    let slow = {
        let agent = Arc::clone(&agent);
        let root = root.clone();
        tokio::spawn(async move { agent.run(&root, "slow one", vec![]).await })
    };
    entered.notified().await;

    let fast = agent.run(&root, "fast one", vec![]).await.unwrap();
    assert_eq!(fast.kind, OutcomeKind::Answered);
    assert_eq!(agent.sessions().len(), 1);

    // 快会话的转录里看不到慢会话的消息
    let fast_view = llm.seen().pop().unwrap();
    assert!(fast_view.iter().any(|m| m.content == "fast one"));
    assert!(!fast_view.iter().any(|m| m.content == "slow one"));

    root.cancel();
    let slow = slow.await.unwrap().unwrap();
    assert_ne!(slow.session_id, fast.session_id);
    assert!(matches!(slow.kind, OutcomeKind::Cancelled(_)));
}

#[tokio::test]
async fn test_answer_is_written_to_long_term_memory() {
    let dir = TempDir::new().unwrap();
    let memory = InMemoryLongTerm::new(10);
    let llm = ScriptedLlm::new(vec![LlmResponse::text("forty two")], LlmResponse::text("unexpected"));
    let agent = build(config(&dir), llm)
        .with_memory(Arc::new(memory.clone()))
        .build()
        .unwrap();

    agent.run(&CancellationToken::new(), "what is the answer", vec![]).await.unwrap();

    let mut stored = Vec::new();
    for _ in 0..50 {
        stored = memory.search("answer", 5).await.unwrap();
        if !stored.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0], "User: what is the answer | Agent: forty two");
}

/// 第一次调用即失败、与取消无关的后端
struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn chat(
        &self,
        _cancel: &CancellationToken,
        _transcript: &[Message],
        _tools: &[Arc<dyn Tool>],
    ) -> Result<LlmResponse, LlmError> {
        Err(LlmError::Request("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_empty_reply_is_nudged_with_continue() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedLlm::new(
        vec![LlmResponse::text(""), LlmResponse::text("done")],
        LlmResponse::text("unexpected"),
    );
    let agent = build(config(&dir), llm.clone()).build().unwrap();

    let outcome = agent.run(&CancellationToken::new(), "say something", vec![]).await.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Answered);
    assert!(outcome.text.ends_with("done"));

    let seen = llm.seen();
    assert_eq!(seen.len(), 2);
    let second = &seen[1];
    let n = second.len();
    assert_eq!(second[n - 2].role, Role::Assistant);
    assert!(second[n - 2].content.is_empty());
    assert_eq!(second[n - 1].role, Role::User);
    assert_eq!(second[n - 1].content, "continue");
}

#[tokio::test]
async fn test_backend_failure_is_error_and_session_removed() {
    let dir = TempDir::new().unwrap();
    let agent = build(config(&dir), Arc::new(FailingLlm)).build().unwrap();

    let result = agent.run(&CancellationToken::new(), "hello", vec![]).await;

    assert!(matches!(result, Err(AgentError::Llm(LlmError::Request(_)))));
    assert!(agent.sessions().is_empty());
}
