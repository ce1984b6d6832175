//! 能力（工具）层：Tool trait、注册表、执行器与内置工具

pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod session_control;
pub mod shell;
pub mod system_info;
pub mod tasks;

pub use echo::EchoTool;
pub use executor::{ToolExecutor, ToolFailure};
pub use filesystem::{FsDeleteTool, FsListTool, FsReadTool, FsSearchTool, FsWriteTool};
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use session_control::SessionControlTool;
pub use shell::ExecTool;
pub use system_info::SysInfoTool;
pub use tasks::{CheckTaskTool, KillTaskTool, ScheduleTaskTool, StartTaskTool};

/// 按字符截断工具输出，超出时追加提示
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n...[output truncated at {max_chars} characters]")
}
