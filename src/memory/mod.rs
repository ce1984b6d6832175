//! 记忆层：短期（会话转录）、长期（跨会话摘要检索）

pub mod conversation;
pub mod long_term;

pub use conversation::{Message, Role, ToolCall, Transcript};
pub use long_term::{FileLongTerm, InMemoryLongTerm, LongTermMemory, MemoryEntry, MemoryError, NoopLongTerm};
