//! 进程级关闭
//!
//! ShutdownManager 持有根取消令牌，所有会话令牌都派生自它。Ctrl+C / SIGTERM / exit
//! 触发后，进行中的会话在各自当前阻塞点上返回取消结果；后台任务不受影响。
//! 只记录第一次触发的原因。

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 exit / quit
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

pub struct ShutdownManager {
    root: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            reason: watch::channel(None).0,
        }
    }

    /// 根令牌（克隆）；会话以它为 parent
    pub fn token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// 触发关闭；重复调用不覆盖第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        let first = self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        if first {
            tracing::info!(reason = ?reason, "shutdown requested, cancelling all sessions");
        }
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    /// 订阅关闭原因；值为 None 表示尚未关闭
    pub fn subscribe(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.reason.subscribe()
    }

    /// 注册 Ctrl+C 与（Unix 下）SIGTERM；须在 tokio 运行时内调用
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let on_ctrl_c = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                on_ctrl_c.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let on_term = Arc::clone(self);
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::spawn(async move {
                        if term.recv().await.is_some() {
                            on_term.shutdown(ShutdownReason::Signal);
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "SIGTERM handler not installed"),
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
