//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Ollama / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmError, LlmResponse, TokenUsage};

use crate::config::AppConfig;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

fn env_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

/// 根据配置与环境变量选择 LLM 后端；缺少 Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = cfg.llm.timeout_secs;

    let (base, model, key) = match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            return Arc::new(MockLlmClient::new());
        }
        "ollama" => (
            cfg.llm.base_url.clone().unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            cfg.llm.model.clone().unwrap_or_else(|| "llama3.1".to_string()),
            None,
        ),
        "deepseek" => match env_key("DEEPSEEK_API_KEY").or_else(|| env_key("OPENAI_API_KEY")) {
            Some(key) => (
                cfg.llm.base_url.clone().unwrap_or_else(|| DEEPSEEK_BASE_URL.to_string()),
                cfg.llm.model.clone().unwrap_or_else(|| DEEPSEEK_CHAT.to_string()),
                Some(key),
            ),
            None => {
                tracing::warn!("DEEPSEEK_API_KEY not set, using Mock LLM");
                return Arc::new(MockLlmClient::new());
            }
        },
        _ => match env_key("OPENAI_API_KEY") {
            Some(key) => (
                cfg.llm
                    .base_url
                    .clone()
                    .unwrap_or_else(|| openai::OPENAI_BASE_URL.to_string()),
                cfg.llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string()),
                Some(key),
            ),
            None => {
                tracing::warn!("No API key set or provider unknown, using Mock LLM");
                return Arc::new(MockLlmClient::new());
            }
        },
    };

    match OpenAiClient::new(Some(&base), &model, key.as_deref(), timeout) {
        Ok(client) => {
            tracing::info!(provider = %provider, model = %model, base_url = %base, "Using OpenAI-compatible LLM");
            match cfg.llm.temperature {
                Some(t) => Arc::new(client.with_temperature(t)),
                None => Arc::new(client),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "LLM client init failed, using Mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}
