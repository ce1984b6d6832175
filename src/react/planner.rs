//! 自由文本中的工具调用恢复
//!
//! 部分后端不走结构化 tool_calls，而是把调用 JSON 写进正文。这里只做一个边界清晰的兜底：
//! 先找 ``` 围栏块，否则取第一个 `{` 到最后一个 `}`；解析成功且带工具名才算调用。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::memory::ToolCall;

/// 恢复结果
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// 正文里没有候选 JSON，或 JSON 中没有工具名：按普通回答处理
    NotACall,
    /// 成功恢复出一次调用
    Call(ToolCall),
    /// 有候选片段但解析失败（调用方记录 warn 后按普通回答处理）
    Malformed(String),
}

const NAME_KEYS: [&str; 3] = ["function", "name", "tool"];
const ARG_KEYS: [&str; 3] = ["arguments", "parameters", "args"];

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n?(.*?)\n?[ \t]*```").ok())
        .as_ref()
}

/// 候选 JSON 片段：围栏块优先，其次最外层花括号区间
pub fn extract_candidate(text: &str) -> Option<&str> {
    if let Some(m) = fence_regex()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
    {
        let inner = m.as_str().trim();
        if !inner.is_empty() {
            return Some(inner);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn arguments_of(obj: &Map<String, Value>) -> Map<String, Value> {
    let raw = ARG_KEYS.iter().find_map(|k| obj.get(*k));
    match raw {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

/// 从正文恢复调用；call_id 由调用方生成（如 call_3）
pub fn recover_invocation(text: &str, call_id: &str) -> Recovery {
    let Some(candidate) = extract_candidate(text) else {
        return Recovery::NotACall;
    };
    let value: Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        Err(e) => return Recovery::Malformed(e.to_string()),
    };
    let Value::Object(obj) = value else {
        return Recovery::NotACall;
    };
    let name = NAME_KEYS
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|n| !n.is_empty());
    match name {
        Some(name) => Recovery::Call(ToolCall::new(call_id, name, arguments_of(&obj))),
        None => Recovery::NotACall,
    }
}
