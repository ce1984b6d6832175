//! 认知层：framing 构建、自由文本调用恢复、会话主循环

pub mod loop_;
pub mod planner;
pub mod prompt;

pub use loop_::{react_loop, CancelStage, LoopExit, ReactSession};
pub use planner::{extract_candidate, recover_invocation, Recovery};
pub use prompt::FramingTemplate;
