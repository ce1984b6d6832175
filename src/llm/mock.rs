//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 第一轮把最后一条 User 消息作为 echo 工具调用发出；拿到工具结果后直接以结果作答。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, LlmError, LlmResponse};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::Tool;

/// Mock 客户端：echo 一次，再回答
#[derive(Debug, Default)]
pub struct MockLlmClient {
    calls: AtomicU64,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        tools: &[Arc<dyn Tool>],
    ) -> Result<LlmResponse, LlmError> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed);

        if let Some(last) = transcript.last().filter(|m| m.role == Role::Tool) {
            return Ok(LlmResponse::text(format!("Mock answer: {}", last.content)));
        }

        let last_user = transcript
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        if !tools.iter().any(|t| t.name() == "echo") {
            return Ok(LlmResponse::text(format!("Mock answer: {last_user}")));
        }

        let mut args = serde_json::Map::new();
        args.insert(
            "text".to_string(),
            serde_json::Value::String(format!("Echo from Mock: {last_user}")),
        );
        Ok(LlmResponse::calls(vec![ToolCall::new(
            format!("mock_{n}"),
            "echo",
            args,
        )]))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
