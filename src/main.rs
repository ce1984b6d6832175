//! drone - 并发会话智能体引擎
//!
//! 入口：加载配置、初始化日志、构建 Agent，然后运行行式 REPL。
//! 每一行输入在独立任务中启动一个会话，结果按完成顺序打印；Ctrl+C 取消全部会话。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drone::config::load_or_default;
use drone::core::{AgentBuilder, ShutdownManager, ShutdownReason};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

/// 关闭时等待进行中会话返回取消结果的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_or_default(config_path);
    drone::observability::init(cfg.app.debug);

    let agent = Arc::new(
        AgentBuilder::new(cfg)
            .build()
            .context("Failed to create agent")?,
    );
    tracing::info!(llm = agent.llm_name(), "drone ready");

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let root = shutdown.token();

    println!("drone ready. Type a request, or 'exit' to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = root.cancelled() => break,
            Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = done {
                    tracing::error!(error = %e, "session task panicked");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let input = line.trim().to_string();
                if input.is_empty() {
                    continue;
                }
                if matches!(input.as_str(), "exit" | "quit") {
                    shutdown.shutdown(ShutdownReason::UserInitiated);
                    break;
                }
                let agent = Arc::clone(&agent);
                let parent = root.clone();
                sessions.spawn(async move {
                    match agent.run(&parent, &input, Vec::new()).await {
                        Ok(outcome) => println!("{outcome}\n"),
                        Err(e) => println!("error: {e}\n"),
                    }
                });
            }
        }
    }

    // EOF 时不取消，让已提交的会话跑完；主动退出时等待它们返回取消结果
    let drain = async { while sessions.join_next().await.is_some() {} };
    if shutdown.is_shutdown() {
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("sessions did not stop in time, exiting anyway");
        }
    } else {
        drain.await;
    }
    Ok(())
}
