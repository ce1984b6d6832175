//! 后台任务工具：start_task / check_task / kill_task / schedule_task
//!
//! 全部委托给共享的 TaskManager；任务不绑定调用它的会话，会话结束后任务照常运行。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Local, NaiveTime, TimeZone};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tasks::{format_duration, KillReport, KillTarget, Task, TaskManager, TaskReport, TaskStatus};
use crate::tools::schema::{args_schema, parse_args};
use crate::tools::{Tool, ToolContext};

fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Running => "[..]",
        TaskStatus::Completed => "[ok]",
        TaskStatus::Failed => "[!!]",
        TaskStatus::Killed => "[xx]",
        TaskStatus::Interrupted => "[--]",
    }
}

fn format_list(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks recorded.".to_string();
    }
    let mut out = String::from("TASK LEDGER:\n");
    out.push_str(&"-".repeat(70));
    out.push('\n');
    for t in tasks {
        out.push_str(&format!(
            "{} {:<17} | {:<11} | {:>9} | {}\n",
            status_icon(t.status),
            t.id,
            t.status.as_str().to_uppercase(),
            format_duration(t.elapsed()),
            t.command
        ));
    }
    out
}

fn format_report(report: &TaskReport) -> String {
    let t = &report.task;
    let finished = match t.finished_at {
        Some(at) => at.format("%H:%M:%S").to_string(),
        None if t.status == TaskStatus::Running => "still running".to_string(),
        None => "unknown".to_string(),
    };
    let mut out = format!("TASK REPORT: {}\n{}\n", t.id, "=".repeat(40));
    out.push_str(&format!("Status   : {}\n", t.status.as_str().to_uppercase()));
    out.push_str(&format!("PID      : {}\n", t.pid));
    out.push_str(&format!("Started  : {}\n", t.started_at.format("%H:%M:%S")));
    out.push_str(&format!("Finished : {}\n", finished));
    out.push_str(&format!("Elapsed  : {}\n", format_duration(t.elapsed())));
    if let Some(code) = t.exit_code {
        out.push_str(&format!("Exit code: {}\n", code));
    }
    match report.resources {
        Some(Some(usage)) => {
            out.push_str(&format!("CPU      : {:.2}%\n", usage.cpu_percent));
            out.push_str(&format!("RAM      : {:.2} MB\n", usage.memory_mb));
        }
        Some(None) => out.push_str("Resources: resource usage unavailable\n"),
        None => {}
    }
    out.push_str(&format!("Command  : {}\n", t.command));
    if let Some(dir) = &t.work_dir {
        out.push_str(&format!("Work dir : {}\n", dir));
    }
    out.push_str(&"-".repeat(40));
    out.push_str(&format!("\nLOG TAIL:\n{}\n", report.log_tail));
    out
}

#[derive(Deserialize, JsonSchema)]
struct StartArgs {
    /// Command to run in the background (e.g. 'cargo build', 'npm install').
    command: String,
    /// Working directory for the command (optional).
    #[serde(default)]
    work_dir: Option<String>,
}

/// start_task：启动后台进程
pub struct StartTaskTool {
    manager: Arc<TaskManager>,
}

impl StartTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for StartTaskTool {
    fn name(&self) -> &str {
        "start_task"
    }

    fn description(&self) -> &str {
        "Start a long-running terminal command in the background. Output goes straight to a log file on disk; use check_task to follow it."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<StartArgs>()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: StartArgs = parse_args(args)?;
        let command = args.command.trim();
        if command.is_empty() {
            return Err("missing parameter: command".to_string());
        }
        let work_dir = args.work_dir.as_deref().filter(|d| !d.is_empty()).map(Path::new);
        let started = self
            .manager
            .start(command, work_dir)
            .map_err(|e| e.to_string())?;
        tracing::info!(session_id = %ctx.session_id, task_id = %started.id, "start_task");
        Ok(format!(
            "Background task started.\nID: {}\nPID: {}\nLog: {}\n\nUse check_task to follow its progress.",
            started.id,
            started.pid,
            started.log_path.display()
        ))
    }
}

#[derive(Deserialize, JsonSchema)]
struct CheckArgs {
    /// Task id to inspect (e.g. task_0a1b2c3d4e5f). Omit to list every task.
    #[serde(default)]
    task_id: Option<String>,
}

/// check_task：列表或单任务详情
pub struct CheckTaskTool {
    manager: Arc<TaskManager>,
}

impl CheckTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for CheckTaskTool {
    fn name(&self) -> &str {
        "check_task"
    }

    fn description(&self) -> &str {
        "Show the status, live CPU/RAM usage and recent log output of a background task. Without task_id, lists all tasks."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<CheckArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: CheckArgs = parse_args(args)?;
        match args.task_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(format_list(&self.manager.list())),
            Some(id) => {
                let report = self.manager.status(id).await.map_err(|e| e.to_string())?;
                Ok(format_report(&report))
            }
        }
    }
}

#[derive(Deserialize, JsonSchema)]
struct KillArgs {
    /// Task id to stop.
    #[serde(default)]
    task_id: Option<String>,
    /// OS process id to stop when no task id is known.
    #[serde(default)]
    pid: Option<u32>,
}

/// kill_task：按任务 id 或 pid 终止整棵进程树
pub struct KillTaskTool {
    manager: Arc<TaskManager>,
}

impl KillTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for KillTaskTool {
    fn name(&self) -> &str {
        "kill_task"
    }

    fn description(&self) -> &str {
        "Stop a background task (by task_id) or a stray OS process (by pid), including every child process."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<KillArgs>()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: KillArgs = parse_args(args)?;
        let target = match (args.task_id.filter(|s| !s.trim().is_empty()), args.pid) {
            (Some(id), _) => KillTarget::Task(id.trim().to_string()),
            (None, Some(pid)) if pid > 0 => KillTarget::Pid(pid),
            _ => return Err("missing parameter: provide task_id or pid".to_string()),
        };
        tracing::info!(session_id = %ctx.session_id, target = ?target, "kill_task");
        match self.manager.kill(target).map_err(|e| e.to_string())? {
            KillReport::Killed { id, pid, signalled } => Ok(format!(
                "Task {id} (PID {pid}) stopped; {signalled} process(es) signalled."
            )),
            KillReport::NotActive { id, status } => Ok(format!(
                "Task {id} is not active. Current status: {status}"
            )),
            KillReport::Process { pid, signalled } => Ok(format!(
                "Process {pid} stopped; {signalled} process(es) signalled."
            )),
        }
    }
}

#[derive(Deserialize, JsonSchema)]
struct ScheduleArgs {
    /// Command to run when the time comes.
    command: String,
    /// Short name for the schedule (e.g. 'nightly_backup').
    #[serde(default)]
    task_name: Option<String>,
    /// Run after this many minutes. Leave empty when using time_hhmm.
    #[serde(default)]
    delay_minutes: Option<f64>,
    /// Run at this local time, e.g. '14:30'. Leave empty when using delay_minutes.
    #[serde(default)]
    time_hhmm: Option<String>,
}

/// 距离下一个 hh:mm（本地时间）的秒数；已过则顺延到明天
fn seconds_until(hhmm: &str) -> Result<i64, String> {
    let target = NaiveTime::parse_from_str(hhmm.trim(), "%H:%M")
        .map_err(|_| "time_hhmm must look like '15:30'".to_string())?;
    let now = Local::now();
    let mut at = now.date_naive().and_time(target);
    if at <= now.naive_local() {
        at += ChronoDuration::days(1);
    }
    let at = Local
        .from_local_datetime(&at)
        .earliest()
        .ok_or_else(|| "time_hhmm falls into a clock change".to_string())?;
    Ok(at.signed_duration_since(now).num_seconds().max(0))
}

fn human_delay(secs: i64) -> String {
    if secs >= 3600 {
        format!("{:.1} hours", secs as f64 / 3600.0)
    } else if secs >= 60 {
        format!("{:.1} minutes", secs as f64 / 60.0)
    } else {
        format!("{secs} seconds")
    }
}

/// 计划名会写进 shell 文本，只保留 [A-Za-z0-9_-]，其余替换为 '_'
fn schedule_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn delayed_command(name: &str, delay_secs: i64, command: &str) -> String {
    if cfg!(windows) {
        format!(
            "Write-Output 'scheduled: {name}, waiting {delay_secs}s'; Start-Sleep -Seconds {delay_secs}; {command}"
        )
    } else {
        format!("echo 'scheduled: {name}, waiting {delay_secs}s'; sleep {delay_secs}; {command}")
    }
}

/// schedule_task：延时执行，落地为一个先 sleep 的后台任务，可被 check_task / kill_task 管理
pub struct ScheduleTaskTool {
    manager: Arc<TaskManager>,
}

impl ScheduleTaskTool {
    pub fn new(manager: Arc<TaskManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ScheduleTaskTool {
    fn name(&self) -> &str {
        "schedule_task"
    }

    fn description(&self) -> &str {
        "Run a command later: after delay_minutes, or at the next local time_hhmm. The schedule is a background task you can inspect with check_task or cancel with kill_task."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ScheduleArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: ScheduleArgs = parse_args(args)?;
        let command = args.command.trim();
        if command.is_empty() {
            return Err("missing parameter: command".to_string());
        }
        let name = args
            .task_name
            .map(|n| schedule_name(&n))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("scheduled_{}", Local::now().timestamp()));

        let delay_secs = match (args.delay_minutes, args.time_hhmm.as_deref()) {
            (Some(m), _) if m > 0.0 => (m * 60.0).round() as i64,
            (_, Some(t)) if !t.trim().is_empty() => seconds_until(t)?,
            _ => return Err("provide either delay_minutes or time_hhmm".to_string()),
        };

        let started = self
            .manager
            .start(&delayed_command(&name, delay_secs, command), None)
            .map_err(|e| e.to_string())?;
        Ok(format!(
            "Scheduled '{name}' as task {} (PID {}).\nRuns in {}.\nCommand: {command}",
            started.id,
            started.pid,
            human_delay(delay_secs)
        ))
    }
}
