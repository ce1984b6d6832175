//! 后台任务：脱离会话生命周期的 OS 进程
//!
//! - **manager**: 启动 / 监视 / 查询 / 终止，进程退出时由 watcher 归类状态
//! - **ledger**: 任务账本（JSON 整文件重写），重启时把 running 标记为 interrupted
//! - **process**: Shell 构造、进程树终止、CPU/RAM 采样
//!
//! 任务只做状态迁移，从不删除；账本是只增不减的记录。

pub mod ledger;
pub mod manager;
pub mod process;

use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use manager::{KillReport, KillTarget, StartedTask, TaskManager, TaskReport};
pub use process::ResourceUsage;

/// 任务状态；除 Running 外均为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Killed,
    Interrupted,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一个后台进程的记录；cancel 只存在于内存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    pub pid: u32,
    pub status: TaskStatus,
    pub log_path: PathBuf,
    pub started_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl Task {
    /// 已运行时长（终态按结束时间计算）
    pub fn elapsed(&self) -> chrono::Duration {
        let end = self.finished_at.unwrap_or_else(Local::now);
        end.signed_duration_since(self.started_at)
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("no process with pid {0}")]
    ProcessNotFound(u32),

    #[error("cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start task: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("task ledger {path} is unreadable: {source}")]
    Ledger {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// chrono 时长的简短表示（1h02m03s / 4m05s / 6s）
pub fn format_duration(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{s}s")
    }
}
