//! sys_info：操作系统、硬件与关键环境变量

use async_trait::async_trait;
use serde_json::Value;
use sysinfo::System;

use crate::tools::{Tool, ToolContext};

const KEY_ENV_VARS: &[&str] = &["PATH", "HOME", "USERPROFILE", "SHELL", "CARGO_HOME"];

pub struct SysInfoTool;

fn snapshot() -> String {
    let mut sys = System::new();
    sys.refresh_memory();
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let host = System::host_name().unwrap_or_else(|| "unknown".to_string());
    let os = System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string());
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let gib = |bytes: u64| bytes as f64 / 1024.0 / 1024.0 / 1024.0;

    let mut out = String::from("SYSTEM INFO:\n---------------------------------\n");
    out.push_str(&format!("OS / Arch      : {} / {}\n", os, std::env::consts::ARCH));
    out.push_str(&format!("CPU cores      : {}\n", cpus));
    out.push_str(&format!(
        "Memory         : {:.1} GiB used of {:.1} GiB\n",
        gib(sys.used_memory()),
        gib(sys.total_memory())
    ));
    out.push_str(&format!("Hostname       : {}\n", host));
    out.push_str(&format!("User           : {}\n", user));
    out.push_str(&format!("Working dir    : {}\n", cwd));
    out.push_str("---------------------------------\nKEY ENVIRONMENT:\n");
    for name in KEY_ENV_VARS {
        if let Ok(val) = std::env::var(name) {
            if !val.is_empty() {
                out.push_str(&format!("{}={}\n", name, val));
            }
        }
    }
    out
}

#[async_trait]
impl Tool for SysInfoTool {
    fn name(&self) -> &str {
        "sys_info"
    }

    fn description(&self) -> &str {
        "Report the operating system, hardware, current user, working directory and key environment variables."
    }

    async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<String, String> {
        tokio::task::spawn_blocking(snapshot)
            .await
            .map_err(|e| format!("sys_info failed: {e}"))
    }
}
