//! drone - 并发会话智能体引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话、会话注册表、编排器、构建器、进程关闭
//! - **llm**: 后端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 对话转录与长期记忆
//! - **observability**: 日志初始化
//! - **react**: framing 构建、自由文本调用恢复、会话主循环
//! - **tasks**: 后台任务管理器与持久化账本
//! - **tools**: 工具 trait、注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tasks;
pub mod tools;

pub use crate::core::{Agent, AgentBuilder, AgentError, SessionOutcome};
