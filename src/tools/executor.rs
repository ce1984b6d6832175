//! 工具执行器
//!
//! 持有共享的 ToolRegistry 与全局超时，execute 在超时内调用工具，同时监听会话取消令牌；
//! 失败统一转为 ToolFailure；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::memory::ToolCall;
use crate::tools::{Tool, ToolContext, ToolRegistry};

/// 单次工具调用的失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("capability '{0}' is not registered")]
    Unknown(String),

    #[error("{0}")]
    Failed(String),

    #[error("capability '{0}' timed out after {1}s")]
    Timeout(String, u64),

    #[error("cancelled")]
    Cancelled,
}

/// 工具执行器：对每次调用施加超时与取消
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 当前工具列表（已排序）
    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.registry.list()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 执行一次调用；取消优先于超时与结果
    pub async fn execute(&self, ctx: &ToolContext, call: &ToolCall) -> Result<String, ToolFailure> {
        let start = Instant::now();
        let args = call.args_value();
        let args_preview = args_preview(&args);

        let result = match self.registry.get(&call.name) {
            None => Err(ToolFailure::Unknown(call.name.clone())),
            Some(tool) => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(ToolFailure::Cancelled),
                    r = tokio::time::timeout(self.timeout, tool.execute(ctx, args)) => match r {
                        Ok(Ok(content)) => Ok(content),
                        Ok(Err(e)) => Err(ToolFailure::Failed(e)),
                        Err(_) => Err(ToolFailure::Timeout(call.name.clone(), self.timeout.as_secs())),
                    },
                }
            }
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolFailure::Unknown(_)) => "unknown",
            Err(ToolFailure::Failed(_)) => "error",
            Err(ToolFailure::Timeout(..)) => "timeout",
            Err(ToolFailure::Cancelled) => "cancelled",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "session_id": ctx.session_id,
            "tool": call.name,
            "call_id": call.id,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
