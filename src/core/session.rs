//! 会话与会话注册表
//!
//! 两级锁：注册表的 RwLock 只保护成员关系（id -> 取消句柄），每个会话自己的 Mutex 保护转录。
//! 控制路径（list / cancel）只拿注册表锁，永远不碰目标会话的转录锁，
//! 因此会话可以通过 session_control 工具列出或取消自身而不会死锁。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Local};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::memory::Transcript;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// 进程生命周期内唯一的会话 ID，形如 TSK-0001A
pub fn next_session_id() -> String {
    format!("TSK-{:05X}", NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
}

/// 一次对话请求的可变状态，由创建它的编排器独占
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Local>,
    cancel_token: CancellationToken,
    transcript: Mutex<Transcript>,
}

impl Session {
    /// 创建会话；取消令牌派生自调用方的 parent，父令牌取消会级联到会话
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            id: next_session_id(),
            created_at: Local::now(),
            cancel_token: parent.child_token(),
            transcript: Mutex::new(Transcript::new()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            created_at: self.created_at,
            cancel_token: self.cancel_token.clone(),
        }
    }

    /// 在转录锁内执行闭包
    pub async fn with_transcript<R>(&self, f: impl FnOnce(&mut Transcript) -> R) -> R {
        let mut transcript = self.transcript.lock().await;
        f(&mut transcript)
    }

    /// 转录快照（拷贝）
    pub async fn snapshot(&self) -> Vec<crate::memory::Message> {
        self.transcript.lock().await.snapshot()
    }
}

/// 注册表中保存的会话引用：只含 id、创建时间与取消句柄，不含转录
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub id: String,
    pub created_at: DateTime<Local>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// list() 返回的快照项
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Local>,
}

/// 进行中会话的并发目录
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id.clone(), handle);
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// 所有存活会话的 id + 创建时间，按创建时间排序
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<SessionInfo> = sessions
            .values()
            .map(|h| SessionInfo {
                id: h.id.clone(),
                created_at: h.created_at,
            })
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// 触发会话的取消句柄；重复取消是无害的空操作
    pub fn cancel(&self, id: &str) -> Result<(), AgentError> {
        let handle = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;
        handle.cancel();
        tracing::warn!(session_id = %id, "session cancel requested");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 注册会话并返回守卫；守卫 drop 时移除，覆盖所有退出路径（含 panic 与 future 被丢弃）
    pub fn enroll(self: &Arc<Self>, session: &Session) -> RegistrationGuard {
        self.register(session.handle());
        RegistrationGuard {
            registry: Arc::clone(self),
            id: session.id.clone(),
        }
    }
}

/// 会话注册守卫
pub struct RegistrationGuard {
    registry: Arc<SessionRegistry>,
    id: String,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.id) {
            tracing::debug!(session_id = %self.id, "session removed from registry");
        }
    }
}
