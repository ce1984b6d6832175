//! 会话编排器
//!
//! 每次请求创建一个 Session，登记到注册表，驱动会话主循环，直到回答 / 取消 / 步数耗尽。
//! 回答产生后以 fire-and-forget 方式写入长期记忆；会话在任何退出路径上都会从注册表移除。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, Session, SessionRegistry};
use crate::llm::LlmClient;
use crate::memory::{LongTermMemory, Message};
use crate::react::{react_loop, CancelStage, FramingTemplate, LoopExit, ReactSession};
use crate::tasks::TaskManager;
use crate::tools::{ToolExecutor, ToolRegistry};

/// 会话的终止方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    Answered,
    Cancelled(CancelStage),
    LoopLimit,
}

/// run() 的结果；取消与步数耗尽不是错误
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub kind: OutcomeKind,
    pub text: String,
}

impl SessionOutcome {
    pub fn is_answered(&self) -> bool {
        self.kind == OutcomeKind::Answered
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// 编排器：持有后端、工具执行器、会话注册表与长期记忆，可被多个会话并发共享
pub struct Agent {
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) executor: ToolExecutor,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) framing: FramingTemplate,
    pub(crate) memory: Arc<dyn LongTermMemory>,
    pub(crate) tasks: Option<Arc<TaskManager>>,
    pub(crate) max_steps: usize,
    pub(crate) context_window: usize,
    pub(crate) memory_timeout: Duration,
}

impl Agent {
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.executor.registry()
    }

    pub fn task_manager(&self) -> Option<&Arc<TaskManager>> {
        self.tasks.as_ref()
    }

    pub fn llm_name(&self) -> &str {
        self.llm.name()
    }

    /// 处理一次请求。parent 取消（如进程关闭）会级联到本会话。
    pub async fn run(
        &self,
        parent: &CancellationToken,
        input: &str,
        images: Vec<String>,
    ) -> Result<SessionOutcome, AgentError> {
        let session = Session::new(parent);
        let _guard = self.sessions.enroll(&session);
        tracing::info!(session_id = %session.id, images = images.len(), "session started");

        session
            .with_transcript(|t| t.push(Message::user_with_images(input, images)))
            .await;

        let cfg = ReactSession::new(self.llm.as_ref(), &self.executor, &self.framing)
            .with_max_steps(self.max_steps)
            .with_context_window(self.context_window);

        let exit = react_loop(&cfg, &session).await?;
        let id = session.id.clone();
        let outcome = match exit {
            LoopExit::Answer { text, steps } => {
                tracing::info!(session_id = %id, steps, "session answered");
                self.remember(&id, input, &text, steps);
                SessionOutcome {
                    text: format!("[{id}]\n{text}"),
                    session_id: id,
                    kind: OutcomeKind::Answered,
                }
            }
            LoopExit::Cancelled(stage) => {
                tracing::warn!(session_id = %id, stage = %stage, "session cancelled");
                SessionOutcome {
                    text: format!("[{id}] session cancelled {stage}."),
                    session_id: id,
                    kind: OutcomeKind::Cancelled(stage),
                }
            }
            LoopExit::LoopLimit { steps } => SessionOutcome {
                text: format!(
                    "[{id}] loop limit exceeded: stopped after {steps} steps without a final answer."
                ),
                session_id: id,
                kind: OutcomeKind::LoopLimit,
            },
        };
        Ok(outcome)
    }

    /// 异步写入长期记忆；失败只记录日志，不影响本次结果
    fn remember(&self, session_id: &str, input: &str, answer: &str, steps: usize) {
        if !self.memory.enabled() {
            return;
        }
        let memory = Arc::clone(&self.memory);
        let limit = self.memory_timeout;
        let text = format!("User: {input} | Agent: {answer}");
        let metadata = json!({ "session_id": session_id, "steps": steps });
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(limit, memory.add(&text, metadata)).await {
                Ok(Ok(())) => tracing::debug!(session_id = %session_id, "memory stored"),
                Ok(Err(e)) => tracing::warn!(session_id = %session_id, error = %e, "memory write failed"),
                Err(_) => tracing::warn!(
                    session_id = %session_id,
                    timeout_secs = limit.as_secs(),
                    "memory write timed out"
                ),
            }
        });
    }
}
