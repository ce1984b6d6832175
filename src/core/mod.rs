//! 核心编排层：错误、会话与注册表、编排器、构建器、进程关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod shutdown;

pub use builder::AgentBuilder;
pub use error::AgentError;
pub use orchestrator::{Agent, OutcomeKind, SessionOutcome};
pub use session::{
    next_session_id, RegistrationGuard, Session, SessionHandle, SessionInfo, SessionRegistry,
};
pub use shutdown::{ShutdownManager, ShutdownReason};
