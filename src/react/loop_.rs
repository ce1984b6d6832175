//! 会话主循环：framing → 剪枝 → 调用后端 → 执行工具 → 观察，直到回答 / 取消 / 步数耗尽
//!
//! 每个阻塞点（后端调用、工具执行）都与会话取消令牌赛跑，取消在一次阻塞调用内即可生效，
//! 而不必等到下一轮开头的检查。同一会话内的工具调用严格按后端返回的顺序串行执行。

use std::fmt;

use crate::core::{AgentError, Session};
use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::react::planner::{recover_invocation, Recovery};
use crate::react::prompt::FramingTemplate;
use crate::tools::{ToolContext, ToolExecutor, ToolFailure};

/// 空回复时追加的推进消息
const CONTINUE_NUDGE: &str = "continue";

/// 取消发生的阶段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelStage {
    /// 轮次开始前
    BeforeStep,
    /// 等待后端回复时
    ModelCall,
    /// 执行某个工具时（或刚执行完）
    Capability(String),
}

impl fmt::Display for CancelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelStage::BeforeStep => f.write_str("before the next step"),
            CancelStage::ModelCall => f.write_str("while waiting for the model"),
            CancelStage::Capability(name) => write!(f, "while running '{name}'"),
        }
    }
}

/// 循环的终止方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    Answer { text: String, steps: usize },
    Cancelled(CancelStage),
    LoopLimit { steps: usize },
}

/// 一次循环所需的协作者（借用，不拥有）
pub struct ReactSession<'a> {
    pub llm: &'a dyn LlmClient,
    pub executor: &'a ToolExecutor,
    pub framing: &'a FramingTemplate,
    pub max_steps: usize,
    pub context_window: usize,
}

impl<'a> ReactSession<'a> {
    pub fn new(llm: &'a dyn LlmClient, executor: &'a ToolExecutor, framing: &'a FramingTemplate) -> Self {
        Self {
            llm,
            executor,
            framing,
            max_steps: 15,
            context_window: 20,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_context_window(mut self, context_window: usize) -> Self {
        self.context_window = context_window;
        self
    }
}

/// 在会话上运行循环。调用方负责放入用户消息、注册与移除会话。
pub async fn react_loop(cfg: &ReactSession<'_>, session: &Session) -> Result<LoopExit, AgentError> {
    let cancel = session.cancel_token();
    let ctx = ToolContext::new(session.id.clone(), cancel.clone());

    for step in 1..=cfg.max_steps {
        if cancel.is_cancelled() {
            return Ok(LoopExit::Cancelled(CancelStage::BeforeStep));
        }

        let tools = cfg.executor.tools();
        let framing = Message::system(cfg.framing.render(&tools));
        let trimmed = session
            .with_transcript(|t| {
                t.refresh_framing(framing);
                t.trim_window(cfg.context_window)
            })
            .await;
        if trimmed {
            tracing::debug!(session_id = %session.id, step, "context window trimmed");
        }

        let snapshot = session.snapshot().await;
        tracing::debug!(session_id = %session.id, step, messages = snapshot.len(), "calling model");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            r = cfg.llm.chat(&cancel, &snapshot, &tools) => r,
        };
        let response = match result {
            Ok(r) => r,
            Err(_) if cancel.is_cancelled() => {
                return Ok(LoopExit::Cancelled(CancelStage::ModelCall));
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, step, error = %e, "model call failed");
                return Err(AgentError::Llm(e));
            }
        };

        let mut content = response.content;
        let mut calls = response.tool_calls;
        if calls.is_empty() {
            match recover_invocation(&content, &format!("call_{step}")) {
                Recovery::Call(call) => {
                    tracing::info!(session_id = %session.id, tool = %call.name, "invocation recovered from free text");
                    calls.push(call);
                    content.clear();
                }
                Recovery::Malformed(err) => {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "free-text invocation candidate did not parse, treating reply as final"
                    );
                }
                Recovery::NotACall => {}
            }
        }

        session
            .with_transcript(|t| t.push(Message::assistant_with_calls(content.clone(), calls.clone())))
            .await;

        if calls.is_empty() {
            if !content.trim().is_empty() {
                return Ok(LoopExit::Answer {
                    text: content,
                    steps: step,
                });
            }
            tracing::debug!(session_id = %session.id, step, "empty reply, nudging");
            session
                .with_transcript(|t| t.push(Message::user(CONTINUE_NUDGE)))
                .await;
            continue;
        }

        for call in &calls {
            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled(CancelStage::Capability(call.name.clone())));
            }
            tracing::info!(session_id = %session.id, step, tool = %call.name, "capability call");
            let observation = match cfg.executor.execute(&ctx, call).await {
                Ok(output) => output,
                Err(ToolFailure::Cancelled) => {
                    return Ok(LoopExit::Cancelled(CancelStage::Capability(call.name.clone())));
                }
                Err(failure) => {
                    tracing::warn!(session_id = %session.id, tool = %call.name, error = %failure, "capability failed");
                    format!("ERROR: {failure}\nAnalyze the error and fix the call before retrying.")
                }
            };
            session
                .with_transcript(|t| t.push(Message::tool_result(call, observation)))
                .await;
            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled(CancelStage::Capability(call.name.clone())));
            }
        }
    }

    tracing::warn!(session_id = %session.id, steps = cfg.max_steps, "step budget exhausted");
    Ok(LoopExit::LoopLimit {
        steps: cfg.max_steps,
    })
}
