//! 长期记忆：跨会话的文本摘要存储与检索
//!
//! 支持 add(text, metadata) 与 search(query, k)；InMemoryLongTerm 按关键词重叠检索，
//! FileLongTerm 在此基础上把条目整文件写回 JSON。编排器以 fire-and-forget 方式写入。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("memory io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("memory encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 长期记忆 trait：写入与检索
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// 存入一段文本及元数据
    async fn add(&self, text: &str, metadata: serde_json::Value) -> Result<(), MemoryError>;

    /// 按查询检索最相关的 limit 条
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, MemoryError>;

    /// 是否启用（Noop 实现返回 false）
    fn enabled(&self) -> bool {
        true
    }
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

#[async_trait]
impl LongTermMemory for NoopLongTerm {
    async fn add(&self, _text: &str, _metadata: serde_json::Value) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<String>, MemoryError> {
        Ok(Vec::new())
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// 一条记忆
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// 将文本切分为小写词集合，用于简单相似度（词重叠数）
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| w.len() > 1)
        .collect()
}

fn rank(entries: &[MemoryEntry], query: &str, limit: usize) -> Vec<String> {
    let query_tokens = tokenize_lower(query);
    if query_tokens.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(usize, &MemoryEntry)> = entries
        .iter()
        .map(|e| (tokenize_lower(&e.content).intersection(&query_tokens).count(), e))
        .filter(|(s, _)| *s > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, e)| e.content.clone())
        .collect()
}

/// 简单内存实现：按关键词重叠检索，超出 max_entries 丢弃最旧条目
#[derive(Clone)]
pub struct InMemoryLongTerm {
    store: Arc<RwLock<Vec<MemoryEntry>>>,
    max_entries: usize,
}

impl InMemoryLongTerm {
    pub fn new(max_entries: usize) -> Self {
        Self {
            store: Arc::new(RwLock::new(Vec::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, entry: MemoryEntry) -> Vec<MemoryEntry> {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        store.push(entry);
        let n = store.len();
        if n > self.max_entries {
            store.drain(0..n - self.max_entries);
        }
        store.clone()
    }
}

impl Default for InMemoryLongTerm {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl LongTermMemory for InMemoryLongTerm {
    async fn add(&self, text: &str, metadata: serde_json::Value) -> Result<(), MemoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.push(MemoryEntry {
            content: text.to_string(),
            metadata,
            created_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, MemoryError> {
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rank(&store, query, limit))
    }
}

/// 文件实现：内存检索 + 每次写入整文件落盘（JSON 数组）
pub struct FileLongTerm {
    path: PathBuf,
    inner: InMemoryLongTerm,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileLongTerm {
    /// 打开（或新建）记忆文件；损坏的文件按空处理并记录警告
    pub fn open(path: impl AsRef<Path>, max_entries: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let inner = InMemoryLongTerm::new(max_entries);
        match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<Vec<MemoryEntry>>(&data) {
                Ok(entries) => {
                    for e in entries {
                        inner.push(e);
                    }
                }
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "long-term memory file unreadable, starting empty"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "long-term memory file unreadable, starting empty"),
        }
        Self {
            path,
            inner,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[async_trait]
impl LongTermMemory for FileLongTerm {
    async fn add(&self, text: &str, metadata: serde_json::Value) -> Result<(), MemoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let snapshot = self.inner.push(MemoryEntry {
            content: text.to_string(),
            metadata,
            created_at: chrono::Utc::now(),
        });
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>, MemoryError> {
        self.inner.search(query, limit).await
    }
}
