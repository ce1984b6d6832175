//! 任务账本持久化
//!
//! 整个 id → Task 映射序列化为带缩进的 JSON，先写临时文件再 rename，
//! 避免写到一半崩溃留下半个文件。

use std::collections::BTreeMap;
use std::path::Path;

use super::{Task, TaskError, TaskStatus};

pub type Ledger = BTreeMap<String, Task>;

/// 读取账本；文件不存在视为空账本
pub fn load(path: &Path) -> Result<Ledger, TaskError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Ledger::new()),
        Err(e) => return Err(e.into()),
    };
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Ledger::new());
    }
    serde_json::from_slice(&data).map_err(|source| TaskError::Ledger {
        path: path.to_path_buf(),
        source,
    })
}

/// 整文件重写
pub fn save(path: &Path, ledger: &Ledger) -> Result<(), TaskError> {
    let data = serde_json::to_vec_pretty(ledger).map_err(|source| TaskError::Ledger {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// 将遗留的 running 任务标记为 interrupted，返回被改写的 id
pub fn mark_interrupted(ledger: &mut Ledger) -> Vec<String> {
    ledger
        .values_mut()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| {
            t.status = TaskStatus::Interrupted;
            t.id.clone()
        })
        .collect()
}
