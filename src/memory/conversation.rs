//! 短期记忆：会话转录（Transcript）
//!
//! 每个会话持有一份有序消息列表：位置 0 固定为 framing（system）消息，其后依次是
//! user / assistant / tool 结果。refresh_framing 原地替换 framing，trim_window 做滑动窗口剪枝。

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致；Tool 为工具执行结果）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型请求的一次工具调用：id + 工具名 + 参数对象
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// 参数以 JSON Value 形式交给工具
    pub fn args_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.arguments.clone())
    }
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// 图片（URL、data URL 或 base64），仅 user 消息使用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// tool 消息：产生该结果的工具名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// tool 消息：所回答的调用 id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            images: Vec::new(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content.into())
    }

    pub fn user_with_images(content: impl Into<String>, images: Vec<String>) -> Self {
        let mut msg = Self::plain(Role::User, content.into());
        msg.images = images;
        msg
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content.into())
    }

    /// 模型回复：文本 + 可能的工具调用
    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::plain(Role::Assistant, content.into());
        msg.tool_calls = tool_calls;
        msg
    }

    /// 工具结果：必须携带所回答的调用 id
    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        let mut msg = Self::plain(Role::Tool, content.into());
        msg.name = Some(call.name.clone());
        msg.tool_call_id = Some(call.id.clone());
        msg
    }

    pub fn is_framing(&self) -> bool {
        self.role == Role::System
    }
}

/// 会话转录：位置 0 为 framing，之后按事件顺序追加
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// 发给后端的快照（拷贝，不暴露活动切片）
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// 放置 framing：已有则原地替换，没有则插到最前
    pub fn refresh_framing(&mut self, framing: Message) {
        match self.messages.first() {
            Some(first) if first.is_framing() => self.messages[0] = framing,
            _ => self.messages.insert(0, framing),
        }
    }

    /// 超过 ceiling 时只保留 framing + 最近 ceiling-1 条；返回是否发生剪枝
    pub fn trim_window(&mut self, ceiling: usize) -> bool {
        let ceiling = ceiling.max(2);
        if self.messages.len() <= ceiling {
            return false;
        }
        let keep_from = self.messages.len() - (ceiling - 1);
        self.messages.drain(1..keep_from);
        true
    }
}
