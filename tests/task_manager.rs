//! 后台任务管理器集成测试（真实子进程，仅 Unix）
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use drone::tasks::{KillReport, KillTarget, Task, TaskError, TaskManager, TaskStatus};
use drone::tools::{CheckTaskTool, KillTaskTool, StartTaskTool, Tool, ToolContext};
use serde_json::json;
use tempfile::TempDir;

/// 轮询直到任务进入终态
async fn wait_terminal(tm: &TaskManager, id: &str) -> Task {
    for _ in 0..200 {
        if let Some(task) = tm.get(id) {
            if task.status.is_terminal() && task.cancel.is_none() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {id} did not finish in time");
}

/// 轮询直到日志包含 needle（结束行在落账之后写入）
async fn wait_log(tm: &TaskManager, id: &str, needle: &str) -> String {
    let mut tail = String::new();
    for _ in 0..200 {
        tail = tm.status(id).await.unwrap().log_tail;
        if tail.contains(needle) {
            return tail;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("log of {id} never contained {needle:?}; last tail: {tail}");
}

#[tokio::test]
async fn test_successful_task_logs_output_and_trailer() {
    let dir = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();

    let started = tm.start("echo hello from task; echo oops >&2", None).unwrap();
    assert!(started.pid > 0);
    assert_eq!(started.log_path, dir.path().join(format!("{}.log", started.id)));

    let task = wait_terminal(&tm, &started.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.exit_code, Some(0));

    let tail = wait_log(&tm, &started.id, "task completed successfully.").await;
    assert!(tail.contains("hello from task"));
    assert!(tail.contains("oops"));
    assert!(tail.contains("[SYSTEM "));
}

#[tokio::test]
async fn test_failing_task_is_failed_with_finish_time_and_no_resources() {
    let dir = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();

    let started = tm.start("exit 3", None).unwrap();
    let task = wait_terminal(&tm, &started.id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.exit_code, Some(3));
    assert!(task.finished_at.is_some());

    let report = tm.status(&started.id).await.unwrap();
    assert!(report.resources.is_none());
    wait_log(&tm, &started.id, "task failed:").await;
}

#[tokio::test]
async fn test_work_dir_is_honoured_and_recorded() {
    let dir = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();

    let started = tm.start("touch marker.txt", Some(work.path())).unwrap();
    let task = wait_terminal(&tm, &started.id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(work.path().join("marker.txt").exists());
    assert_eq!(task.work_dir.as_deref(), Some(work.path().display().to_string().as_str()));
}

#[tokio::test]
async fn test_spawn_failure_leaves_no_record_or_log() {
    let dir = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();
    let missing = dir.path().join("no_such_dir");

    let result = tm.start("echo never", Some(&missing));
    assert!(matches!(result, Err(TaskError::Spawn(_))));
    assert!(tm.list().is_empty());

    let logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|x| x == "log"))
        .collect();
    assert!(logs.is_empty(), "orphan log left behind");
}

#[tokio::test]
async fn test_kill_running_task_then_kill_again() {
    let dir = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();

    let started = tm.start("sleep 30", None).unwrap();
    let report = tm.status(&started.id).await.unwrap();
    assert_eq!(report.task.status, TaskStatus::Running);
    assert!(report.resources.is_some());

    match tm.kill(KillTarget::Task(started.id.clone())).unwrap() {
        KillReport::Killed { id, pid, .. } => {
            assert_eq!(id, started.id);
            assert_eq!(pid, started.pid);
        }
        other => panic!("expected Killed, got {other:?}"),
    }

    let task = wait_terminal(&tm, &started.id).await;
    assert_eq!(task.status, TaskStatus::Killed);
    assert!(task.finished_at.is_some());
    wait_log(&tm, &started.id, "task stopped by kill request.").await;

    let again = tm.kill(KillTarget::Task(started.id.clone())).unwrap();
    assert_eq!(
        again,
        KillReport::NotActive {
            id: started.id.clone(),
            status: TaskStatus::Killed
        }
    );

    let on_disk = std::fs::read_to_string(tm.ledger_path()).unwrap();
    assert!(on_disk.contains("\"killed\""));
}

#[tokio::test]
async fn test_kill_by_pid_routes_to_owning_task() {
    let dir = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();

    let started = tm.start("sleep 30", None).unwrap();
    let report = tm.kill(KillTarget::Pid(started.pid)).unwrap();
    assert!(matches!(report, KillReport::Killed { ref id, .. } if *id == started.id));

    let task = wait_terminal(&tm, &started.id).await;
    assert_eq!(task.status, TaskStatus::Killed);
}

#[tokio::test]
async fn test_reopen_relabels_running_as_interrupted() {
    let dir = TempDir::new().unwrap();
    let first = TaskManager::open(dir.path(), 4096).unwrap();
    let started = first.start("sleep 30", None).unwrap();

    // 第二个实例模拟进程重启后读到同一份账本
    let second = TaskManager::open(dir.path(), 4096).unwrap();
    let recovered = second.get(&started.id).unwrap();
    assert_eq!(recovered.status, TaskStatus::Interrupted);
    assert!(recovered.cancel.is_none());

    let on_disk = std::fs::read_to_string(second.ledger_path()).unwrap();
    assert!(on_disk.contains("\"interrupted\""));
    assert!(!on_disk.contains("\"running\""));

    // 恢复出的任务不可再 kill；清理仍由原实例负责
    assert!(matches!(
        second.kill(KillTarget::Task(started.id.clone())).unwrap(),
        KillReport::NotActive { status: TaskStatus::Interrupted, .. }
    ));
    first.kill(KillTarget::Task(started.id.clone())).unwrap();
    wait_terminal(&first, &started.id).await;
}

#[tokio::test]
async fn test_tasks_survive_and_list_in_start_order() {
    let dir = TempDir::new().unwrap();
    let tm = TaskManager::open(dir.path(), 4096).unwrap();

    let a = tm.start("true", None).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b = tm.start("true", None).unwrap();
    wait_terminal(&tm, &a.id).await;
    wait_terminal(&tm, &b.id).await;

    let ids: Vec<String> = tm.list().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
}

#[tokio::test]
async fn test_task_tools_end_to_end() {
    let dir = TempDir::new().unwrap();
    let tm: Arc<TaskManager> = TaskManager::open(dir.path(), 4096).unwrap();
    let ctx = ToolContext::detached();

    let out = StartTaskTool::new(Arc::clone(&tm))
        .execute(&ctx, json!({"command": "sleep 30"}))
        .await
        .unwrap();
    assert!(out.contains("Background task started."));
    let id = tm.list()[0].id.clone();
    assert!(out.contains(&id));

    let check = CheckTaskTool::new(Arc::clone(&tm));
    let listing = check.execute(&ctx, json!({})).await.unwrap();
    assert!(listing.contains(&id));
    assert!(listing.contains("RUNNING"));

    let detail = check.execute(&ctx, json!({"task_id": id})).await.unwrap();
    assert!(detail.contains("Status   : RUNNING"));
    assert!(detail.contains("still running"));

    let kill = KillTaskTool::new(Arc::clone(&tm));
    let stopped = kill.execute(&ctx, json!({"task_id": id})).await.unwrap();
    assert!(stopped.contains("stopped"));
    let again = kill.execute(&ctx, json!({"task_id": id})).await.unwrap();
    assert!(again.contains("is not active"));

    assert!(kill.execute(&ctx, json!({})).await.is_err());
    assert!(check
        .execute(&ctx, json!({"task_id": "task_missing"}))
        .await
        .is_err());
}
