//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRONE__*` 覆盖（双下划线表示嵌套，如 `DRONE__LLM__PROVIDER=openai`）。
//! 所有字段都有默认值，缺失的段或键按默认值补齐。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub tasks: TasksSection,
    pub memory: MemorySection,
}

/// [app] 段：名称、工作目录、framing 模板、安全等级
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 工具的默认工作目录，未设置时用当前目录
    pub work_dir: Option<PathBuf>,
    /// framing 模板文件
    pub prompt_path: PathBuf,
    /// 写入 framing 的策略等级（standard / restricted / ...）
    pub security_level: String,
    /// 打开 debug 日志
    pub debug: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "drone".to_string(),
            work_dir: None,
            prompt_path: PathBuf::from("config/prompts/system.md"),
            security_level: "standard".to_string(),
            debug: false,
        }
    }
}

/// [agent] 段：会话循环的步数预算与上下文窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_steps: usize,
    /// 转录长度上限（含 framing）
    pub context_window: usize,
    /// 长期记忆异步写入的超时（秒）
    pub memory_timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_steps: 15,
            context_window: 20,
            memory_timeout_secs: 30,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / ollama / mock
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            temperature: None,
            timeout_secs: 120,
        }
    }
}

/// [tools] 段：工具超时、sys_exec 限制、输出截断、列表上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒），由 ToolExecutor 施加
    pub tool_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub exec_max_timeout_secs: u64,
    /// sys_exec 命令白名单（首词）；为空表示不限制
    pub allowed_commands: Vec<String>,
    pub max_output_chars: usize,
    pub list_limit: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 360,
            exec_timeout_secs: 60,
            exec_max_timeout_secs: 300,
            allowed_commands: Vec::new(),
            max_output_chars: 4000,
            list_limit: 250,
        }
    }
}

/// [tasks] 段：后台任务日志与账本目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    pub dir: PathBuf,
    pub log_tail_bytes: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs/tasks"),
            log_tail_bytes: 4096,
        }
    }
}

/// [memory] 段：长期记忆文件；path 为空字符串时只用内存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub path: Option<PathBuf>,
    pub max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("memory/long_term.json")),
            max_entries: 2000,
        }
    }
}

/// 从 config 目录加载配置，环境变量 DRONE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRONE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DRONE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时退回默认配置并记录警告
pub fn load_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}
