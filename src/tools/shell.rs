//! sys_exec：前台 Shell 命令，带超时与取消
//!
//! 通过 bash -c / powershell -Command 执行，stdout 与 stderr 合并返回；
//! 禁止 rm -rf、mkfs 等危险子串，可选命令白名单（首词）。超时或会话取消时终止整个进程树。
//! 需要长时间运行的命令应使用 start_task。

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::tasks::process::{kill_process_tree, shell_command};
use crate::tools::schema::{args_schema, parse_args};
use crate::tools::{truncate_output, Tool, ToolContext};

/// 禁止的命令/子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    "chmod -r 777 /",
    ":(){ :|:& };:", // fork bomb
];

/// 管道读取收尾的最长等待（孙进程可能继承管道）
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Deserialize, JsonSchema)]
struct ExecArgs {
    /// Terminal command, e.g. 'ls -la' or 'ipconfig'.
    command: String,
    /// Working directory (optional, defaults to the agent's directory).
    #[serde(default)]
    work_dir: Option<String>,
    /// Timeout in seconds (optional, default 60, capped at 300).
    #[serde(default)]
    timeout: Option<u64>,
}

/// sys_exec 工具
pub struct ExecTool {
    allowed_commands: HashSet<String>,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
    max_output_chars: usize,
    default_dir: Option<PathBuf>,
}

impl ExecTool {
    pub fn new(
        allowed_commands: Vec<String>,
        default_timeout_secs: u64,
        max_timeout_secs: u64,
        max_output_chars: usize,
    ) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            default_timeout_secs: default_timeout_secs.max(1),
            max_timeout_secs: max_timeout_secs.max(1),
            max_output_chars,
            default_dir: None,
        }
    }

    pub fn with_default_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_dir = Some(dir.into());
        self
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = raw_lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.is_empty() || self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }

    fn effective_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, self.max_timeout_secs)
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        let _ = r.read_to_end(&mut buf).await;
    }
    buf
}

async fn drain(task: tokio::task::JoinHandle<Vec<u8>>) -> Vec<u8> {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, task).await {
        Ok(Ok(buf)) => buf,
        _ => Vec::new(),
    }
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let out = String::from_utf8_lossy(stdout);
    let err = String::from_utf8_lossy(stderr);
    let out = out.trim();
    let err = err.trim();
    match (out.is_empty(), err.is_empty()) {
        (_, true) => out.to_string(),
        (true, false) => err.to_string(),
        (false, false) => format!("{out}\n{err}"),
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "sys_exec"
    }

    fn description(&self) -> &str {
        "Run a command in the system terminal and wait for it to finish. For long-running work (servers, builds, downloads) use start_task instead."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ExecArgs>()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: ExecArgs = parse_args(args)?;
        let command = args.command.trim();
        self.is_allowed(command)?;
        let timeout_secs = self.effective_timeout(args.timeout);

        let mut cmd = shell_command(command);
        let dir = args
            .work_dir
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.default_dir.clone());
        if let Some(dir) = &dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(session_id = %ctx.session_id, command = %command, "sys_exec");

        let mut child = cmd.spawn().map_err(|e| format!("Execution failed: {}", e))?;
        let pid = child.id();
        let out_task = tokio::spawn(read_all(child.stdout.take()));
        let err_task = tokio::spawn(read_all(child.stderr.take()));

        let waited = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                kill_process_tree(pid);
                let _ = child.start_kill();
                return Err("Command interrupted: session cancelled".to_string());
            }
            r = tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait()) => r,
        };

        match waited {
            Err(_) => {
                kill_process_tree(pid);
                let _ = child.start_kill();
                let _ = child.wait().await;
                let partial = combine(&drain(out_task).await, &drain(err_task).await);
                Ok(format!(
                    "WARNING: command did not finish within {timeout_secs}s and was stopped.\n\
                     Use start_task for long-running work.\nPartial output:\n{}",
                    truncate_output(&partial, self.max_output_chars)
                ))
            }
            Ok(Err(e)) => Err(format!("Execution failed: {}", e)),
            Ok(Ok(status)) => {
                let output = combine(&drain(out_task).await, &drain(err_task).await);
                let output = truncate_output(&output, self.max_output_chars);
                if !status.success() {
                    return Ok(format!("Command exited with {status}\nOutput:\n{output}"));
                }
                if output.is_empty() {
                    return Ok("Command finished (no output).".to_string());
                }
                Ok(output)
            }
        }
    }
}
