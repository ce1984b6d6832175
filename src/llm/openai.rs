//! OpenAI 兼容 API 客户端
//!
//! 直接用 reqwest 调用 `{base_url}/chat/completions`（OpenAI、DeepSeek、Ollama /v1、自建代理均可）；
//! 工具定义取自各工具的 parameters_schema，user 消息中的图片以 image_url 内容块发送。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, LlmError, LlmResponse, TokenUsage};
use crate::memory::{Message, Role, ToolCall};
use crate::tools::Tool;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: ApiContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ApiFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: FunctionDefinition,
}

#[derive(Debug, Serialize)]
struct FunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// 图片：http(s) / data URL 原样发送，其余视为 base64 PNG
fn image_url(image: &str) -> String {
    if image.starts_with("http://") || image.starts_with("https://") || image.starts_with("data:") {
        image.to_string()
    } else {
        format!("data:image/png;base64,{image}")
    }
}

/// 转录 → API 消息。窗口剪枝可能删掉发起调用的 assistant 消息，
/// 此时孤立的 tool 结果降级为 user 文本，避免端点拒绝请求。
fn to_api_messages(transcript: &[Message]) -> Vec<ApiMessage> {
    let mut open_calls: HashSet<&str> = HashSet::new();
    let mut out = Vec::with_capacity(transcript.len());
    for m in transcript {
        let msg = match m.role {
            Role::System => ApiMessage {
                role: "system",
                content: ApiContent::Text(m.content.clone()),
                name: None,
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            Role::User => {
                let content = if m.images.is_empty() {
                    ApiContent::Text(m.content.clone())
                } else {
                    let mut parts = vec![ContentPart::Text {
                        text: m.content.clone(),
                    }];
                    parts.extend(m.images.iter().map(|img| ContentPart::ImageUrl {
                        image_url: ImageUrl { url: image_url(img) },
                    }));
                    ApiContent::Parts(parts)
                };
                ApiMessage {
                    role: "user",
                    content,
                    name: None,
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                }
            }
            Role::Assistant => {
                open_calls.extend(m.tool_calls.iter().map(|c| c.id.as_str()));
                ApiMessage {
                    role: "assistant",
                    content: ApiContent::Text(m.content.clone()),
                    name: None,
                    tool_calls: m
                        .tool_calls
                        .iter()
                        .map(|c| ApiToolCall {
                            id: c.id.clone(),
                            call_type: function_type(),
                            function: ApiFunctionCall {
                                name: c.name.clone(),
                                arguments: c.args_value().to_string(),
                            },
                        })
                        .collect(),
                    tool_call_id: None,
                }
            }
            Role::Tool => {
                let answered = m
                    .tool_call_id
                    .as_deref()
                    .is_some_and(|id| open_calls.contains(id));
                if answered {
                    ApiMessage {
                        role: "tool",
                        content: ApiContent::Text(m.content.clone()),
                        name: m.name.clone(),
                        tool_calls: Vec::new(),
                        tool_call_id: m.tool_call_id.clone(),
                    }
                } else {
                    ApiMessage {
                        role: "user",
                        content: ApiContent::Text(format!(
                            "[result of {}]\n{}",
                            m.name.as_deref().unwrap_or("tool"),
                            m.content
                        )),
                        name: None,
                        tool_calls: Vec::new(),
                        tool_call_id: None,
                    }
                }
            }
        };
        out.push(msg);
    }
    out
}

fn to_api_tools(tools: &[Arc<dyn Tool>]) -> Vec<ApiTool> {
    tools
        .iter()
        .map(|t| ApiTool {
            tool_type: "function",
            function: FunctionDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            },
        })
        .collect()
}

/// 工具调用参数：JSON 字符串解析为对象；解析失败或非对象时为空
fn parse_arguments(raw: &str) -> serde_json::Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    timeout_secs: u64,
    label: String,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        api_key: Option<&str>,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let timeout_secs = timeout_secs.max(1);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;
        let base_url = base_url
            .unwrap_or(OPENAI_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http,
            label: format!("openai-compat:{model}"),
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()).map(String::from),
            model: model.to_string(),
            temperature: None,
            timeout_secs,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, body: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::Request(e.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<ChatResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn chat(
        &self,
        cancel: &CancellationToken,
        transcript: &[Message],
        tools: &[Arc<dyn Tool>],
    ) -> Result<LlmResponse, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: to_api_messages(transcript),
            tools: to_api_tools(tools),
            temperature: self.temperature,
        };
        tracing::debug!(
            model = %self.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "chat completion request"
        );

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            r = self.send(&body) => r?,
        };

        let usage = response
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens.max(u.prompt_tokens + u.completion_tokens),
            })
            .unwrap_or_default();
        let message = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?
            .message;
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall::new(c.id, c.function.name, parse_arguments(&c.function.arguments)))
            .collect();

        Ok(LlmResponse {
            content: message.content.unwrap_or_default(),
            tool_calls,
            usage,
        })
    }

    fn name(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orphan_tool_result_downgraded() {
        let call = ToolCall::new("call_1", "fs_list", serde_json::Map::new());
        let transcript = vec![
            Message::system("framing"),
            Message::tool_result(&call, "a.txt"),
        ];
        let msgs = to_api_messages(&transcript);
        assert_eq!(msgs[1].role, "user");

        let transcript = vec![
            Message::system("framing"),
            Message::assistant_with_calls("", vec![call.clone()]),
            Message::tool_result(&call, "a.txt"),
        ];
        let msgs = to_api_messages(&transcript);
        assert_eq!(msgs[2].role, "tool");
        assert_eq!(msgs[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_user_images_become_parts() {
        let transcript = vec![Message::user_with_images(
            "what is this",
            vec!["https://x/y.png".into(), "iVBORw0".into()],
        )];
        let v = serde_json::to_value(to_api_messages(&transcript)).unwrap();
        let parts = v[0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[2]["image_url"]["url"], "data:image/png;base64,iVBORw0");
    }

    #[test]
    fn test_response_with_tool_calls() {
        let json = r#"{
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "fs_list", "arguments": "{\"path\": \"/tmp\"}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let resp: ChatResponse = serde_json::from_str(json).unwrap();
        let call = &resp.choices[0].message.tool_calls.as_ref().unwrap()[0];
        let args = parse_arguments(&call.function.arguments);
        assert_eq!(args["path"], "/tmp");
    }

    #[test]
    fn test_bad_arguments_become_empty() {
        assert!(parse_arguments("not json").is_empty());
        assert!(parse_arguments("[1,2]").is_empty());
    }
}
