//! Agent 错误类型
//!
//! 只有真正中止会话的情况才是错误：后端/传输失败、配置错误等。
//! 工具失败折叠进转录，取消与步数耗尽是正常的终止结果（见 SessionOutcome）。

use thiserror::Error;

use crate::llm::LlmError;
use crate::tasks::TaskError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
