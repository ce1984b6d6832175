//! 进程层：Shell 命令构造、进程树终止、资源采样（sysinfo）

use std::collections::HashMap;

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

/// 平台 Shell：Unix 上 `bash -c`，Windows 上 `powershell -Command`
pub fn shell_command(command: &str) -> tokio::process::Command {
    #[cfg(windows)]
    {
        let mut cmd = tokio::process::Command::new("powershell");
        cmd.arg("-NoProfile").arg("-Command").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// 终止以 pid 为根的整棵进程树（先子后父）；返回实际发出信号的进程数
pub fn kill_process_tree(pid: Option<u32>) -> usize {
    let Some(pid) = pid else {
        return 0;
    };
    let root = Pid::from_u32(pid);

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut children_map: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (p, proc_) in sys.processes() {
        if let Some(parent) = proc_.parent() {
            children_map.entry(parent).or_default().push(*p);
        }
    }

    let mut to_kill = Vec::new();
    collect_process_tree(root, &children_map, &mut to_kill);

    let mut killed = 0;
    for pid in to_kill.into_iter().rev() {
        if let Some(proc_) = sys.process(pid) {
            let ok = match proc_.kill_with(Signal::Kill) {
                Some(true) => true,
                Some(false) | None => proc_.kill(),
            };
            if ok {
                killed += 1;
            }
        }
    }
    tracing::debug!(pid, killed, "process tree kill");
    killed
}

fn collect_process_tree(pid: Pid, children_map: &HashMap<Pid, Vec<Pid>>, out: &mut Vec<Pid>) {
    out.push(pid);
    if let Some(children) = children_map.get(&pid) {
        for child in children {
            // pid 复用可能在快照中形成环
            if !out.contains(child) {
                collect_process_tree(*child, children_map, out);
            }
        }
    }
}

/// 运行中进程的实时资源
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// 采样 CPU% 与常驻内存；两次刷新间隔 MINIMUM_CPU_UPDATE_INTERVAL，CPU 才有意义。
/// 进程不存在时返回 None。
pub async fn sample_resources(pid: u32) -> Option<ResourceUsage> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid)?;
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let proc_ = sys.process(pid)?;
    Some(ResourceUsage {
        cpu_percent: proc_.cpu_usage(),
        memory_mb: proc_.memory() as f64 / 1024.0 / 1024.0,
    })
}

/// 进程是否仍在进程表中
pub fn process_exists(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}
