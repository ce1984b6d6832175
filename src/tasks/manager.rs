//! 后台任务管理器
//!
//! 显式构造、以 Arc 注入给需要它的工具（不使用全局单例）。
//! 每个任务一个 watcher（tokio::spawn）等待进程退出并写入结束行；
//! 所有状态变更在同一把锁内整文件重写账本。

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Local;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::ledger::{self, Ledger};
use super::process::{kill_process_tree, process_exists, sample_resources, shell_command, ResourceUsage};
use super::{Task, TaskError, TaskStatus};

const LEDGER_FILE: &str = "task_registry.json";

/// start 的返回
#[derive(Debug, Clone)]
pub struct StartedTask {
    pub id: String,
    pub pid: u32,
    pub log_path: PathBuf,
}

/// kill 的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillTarget {
    Task(String),
    Pid(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillReport {
    /// 任务已被终止（signalled = 实际收到信号的进程数）
    Killed { id: String, pid: u32, signalled: usize },
    /// 任务早已处于终态，未做任何改动
    NotActive { id: String, status: TaskStatus },
    /// 与任务无关的 OS 进程
    Process { pid: u32, signalled: usize },
}

/// 单个任务的详情
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: Task,
    /// 仅 running 任务采样；Some(None) 表示进程信息读取失败
    pub resources: Option<Option<ResourceUsage>>,
    pub log_tail: String,
}

enum Exit {
    Status(ExitStatus),
    WaitError(std::io::Error),
    Cancelled,
}

pub struct TaskManager {
    dir: PathBuf,
    ledger_path: PathBuf,
    log_tail_bytes: u64,
    tasks: Mutex<Ledger>,
}

impl TaskManager {
    /// 打开（或创建）任务目录并加载账本；遗留的 running 任务改为 interrupted 并立即落盘
    pub fn open(dir: impl Into<PathBuf>, log_tail_bytes: u64) -> Result<Arc<Self>, TaskError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let ledger_path = dir.join(LEDGER_FILE);

        let mut tasks = ledger::load(&ledger_path)?;
        let interrupted = ledger::mark_interrupted(&mut tasks);
        if !interrupted.is_empty() {
            ledger::save(&ledger_path, &tasks)?;
            tracing::warn!(count = interrupted.len(), ids = ?interrupted, "tasks from a previous run marked interrupted");
        }
        tracing::info!(dir = %dir.display(), known = tasks.len(), "task manager ready");

        Ok(Arc::new(Self {
            dir,
            ledger_path,
            log_tail_bytes: log_tail_bytes.max(1),
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger_path
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, tasks: &Ledger) {
        if let Err(e) = ledger::save(&self.ledger_path, tasks) {
            tracing::error!(path = %self.ledger_path.display(), error = %e, "failed to write task ledger");
        }
    }

    /// 启动后台进程：输出直接写入日志文件，立即返回；不受任何会话取消影响
    pub fn start(self: &Arc<Self>, command: &str, work_dir: Option<&Path>) -> Result<StartedTask, TaskError> {
        let id = new_task_id();
        let log_path = self.dir.join(format!("{id}.log"));
        let log_file = open_log(&log_path)?;
        let stderr_file = log_file.try_clone().map_err(|source| TaskError::LogFile {
            path: log_path.clone(),
            source,
        })?;
        let trailer_file = log_file.try_clone().map_err(|source| TaskError::LogFile {
            path: log_path.clone(),
            source,
        })?;

        let mut cmd = shell_command(command);
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file));
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // 未落账的任务不留下空日志
                let _ = std::fs::remove_file(&log_path);
                tracing::warn!(command = %command, error = %e, "background task spawn failed");
                return Err(TaskError::Spawn(e));
            }
        };
        let pid = child.id().unwrap_or(0);
        let cancel = CancellationToken::new();

        let task = Task {
            id: id.clone(),
            command: command.to_string(),
            work_dir: work_dir.map(|d| d.display().to_string()),
            pid,
            status: TaskStatus::Running,
            log_path: log_path.clone(),
            started_at: Local::now(),
            finished_at: None,
            exit_code: None,
            cancel: Some(cancel.clone()),
        };
        {
            let mut tasks = self.lock();
            tasks.insert(id.clone(), task);
            self.persist(&tasks);
        }
        tracing::info!(task_id = %id, pid, command = %command, "background task started");

        let manager = Arc::clone(self);
        let watch_id = id.clone();
        tokio::spawn(async move {
            manager.watch(watch_id, child, cancel, trailer_file).await;
        });

        Ok(StartedTask { id, pid, log_path })
    }

    async fn watch(&self, id: String, mut child: Child, cancel: CancellationToken, mut log: File) {
        let exit = tokio::select! {
            r = child.wait() => match r {
                Ok(status) => Exit::Status(status),
                Err(e) => Exit::WaitError(e),
            },
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Exit::Cancelled
            }
        };

        let exit_code = match &exit {
            Exit::Status(s) => s.code(),
            _ => None,
        };
        let status = {
            let mut tasks = self.lock();
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            // kill 先落账再发信号，此处保留 killed
            let status = if task.status == TaskStatus::Killed || cancel.is_cancelled() {
                TaskStatus::Killed
            } else {
                match &exit {
                    Exit::Status(s) if s.success() => TaskStatus::Completed,
                    Exit::Cancelled => TaskStatus::Killed,
                    _ => TaskStatus::Failed,
                }
            };
            task.status = status;
            task.exit_code = exit_code;
            task.finished_at.get_or_insert_with(Local::now);
            task.cancel = None;
            self.persist(&tasks);
            status
        };

        let stamp = Local::now().format("%H:%M:%S");
        let trailer = match (status, &exit) {
            (TaskStatus::Killed, _) => "task stopped by kill request.".to_string(),
            (TaskStatus::Completed, _) => "task completed successfully.".to_string(),
            (_, Exit::Status(s)) => format!("task failed: {s}"),
            (_, Exit::WaitError(e)) => format!("task failed: {e}"),
            (_, Exit::Cancelled) => "task failed: cancelled".to_string(),
        };
        if let Err(e) = writeln!(log, "\n[SYSTEM {stamp}] {trailer}") {
            tracing::warn!(task_id = %id, error = %e, "failed to append task trailer");
        }
        tracing::info!(task_id = %id, status = %status, exit_code = ?exit_code, "background task finished");
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().get(id).cloned()
    }

    /// 所有已知任务（含终态），按启动时间排序
    pub fn list(&self) -> Vec<Task> {
        let mut list: Vec<Task> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// 单任务详情：running 时附带实时 CPU/RAM，日志只取末尾
    pub async fn status(&self, id: &str) -> Result<TaskReport, TaskError> {
        let task = self.get(id).ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        let resources = if task.status == TaskStatus::Running && task.pid > 0 {
            Some(sample_resources(task.pid).await)
        } else {
            None
        };
        let log_tail = match read_tail(&task.log_path, self.log_tail_bytes) {
            Ok(Some(tail)) => tail,
            Ok(None) => "log file not created yet".to_string(),
            Err(e) => format!("log unreadable: {e}"),
        };
        Ok(TaskReport {
            task,
            resources,
            log_tail,
        })
    }

    /// 终止任务或裸 pid。任务路径：落账 killed → 进程树终止 → 取消令牌
    pub fn kill(&self, target: KillTarget) -> Result<KillReport, TaskError> {
        let id = match target {
            KillTarget::Task(id) => id,
            KillTarget::Pid(pid) => {
                let owner = self
                    .lock()
                    .values()
                    .find(|t| t.pid == pid && t.status == TaskStatus::Running)
                    .map(|t| t.id.clone());
                match owner {
                    Some(id) => id,
                    None => {
                        if !process_exists(pid) {
                            return Err(TaskError::ProcessNotFound(pid));
                        }
                        let signalled = kill_process_tree(Some(pid));
                        tracing::warn!(pid, signalled, "untracked process tree killed");
                        return Ok(KillReport::Process { pid, signalled });
                    }
                }
            }
        };

        let (pid, cancel) = {
            let mut tasks = self.lock();
            let task = tasks
                .get_mut(&id)
                .ok_or_else(|| TaskError::NotFound(id.clone()))?;
            if task.status.is_terminal() {
                return Ok(KillReport::NotActive {
                    id,
                    status: task.status,
                });
            }
            task.status = TaskStatus::Killed;
            task.finished_at = Some(Local::now());
            let pid = task.pid;
            let cancel = task.cancel.clone();
            self.persist(&tasks);
            (pid, cancel)
        };

        let signalled = if pid > 0 { kill_process_tree(Some(pid)) } else { 0 };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        tracing::warn!(task_id = %id, pid, signalled, "background task killed");
        Ok(KillReport::Killed { id, pid, signalled })
    }
}

fn new_task_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("task_{}", &hex[..12])
}

fn open_log(path: &Path) -> Result<File, TaskError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| TaskError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

/// 读取文件末尾 limit 字节；截断时加前缀。文件不存在返回 None
fn read_tail(path: &Path, limit: u64) -> std::io::Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let size = file.metadata()?.len();
    let mut buf = Vec::new();
    if size <= limit {
        file.read_to_end(&mut buf)?;
        return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
    }
    file.seek(SeekFrom::Start(size - limit))?;
    file.take(limit).read_to_end(&mut buf)?;
    Ok(Some(format!(
        "...(earlier output kept on disk)...\n{}",
        String::from_utf8_lossy(&buf)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_task_id_shape() {
        let id = new_task_id();
        assert!(id.starts_with("task_"));
        assert_eq!(id.len(), "task_".len() + 12);
    }

    #[test]
    fn test_read_tail_truncates_with_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.log");
        std::fs::write(&path, "0123456789abcdef").unwrap();

        let tail = read_tail(&path, 4).unwrap().unwrap();
        assert!(tail.starts_with("...(earlier output kept on disk)..."));
        assert!(tail.ends_with("cdef"));

        let whole = read_tail(&path, 100).unwrap().unwrap();
        assert_eq!(whole, "0123456789abcdef");

        assert!(read_tail(&dir.path().join("missing.log"), 4).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kill_unknown_task() {
        let dir = TempDir::new().unwrap();
        let tm = TaskManager::open(dir.path(), 4096).unwrap();
        let r = tm.kill(KillTarget::Task("task_nope".into()));
        assert!(matches!(r, Err(TaskError::NotFound(_))));
    }
}
