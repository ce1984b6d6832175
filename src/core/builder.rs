//! Agent 构建器：统一的 Agent 初始化逻辑
//!
//! CLI 与测试共用同一套工具注册；测试通过 with_llm / with_tool 等覆盖个别组件。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{Agent, AgentError, SessionRegistry};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{FileLongTerm, InMemoryLongTerm, LongTermMemory};
use crate::react::FramingTemplate;
use crate::tasks::TaskManager;
use crate::tools::{
    CheckTaskTool, EchoTool, ExecTool, FsDeleteTool, FsListTool, FsReadTool, FsSearchTool,
    FsWriteTool, KillTaskTool, ScheduleTaskTool, SessionControlTool, StartTaskTool, SysInfoTool,
    Tool, ToolExecutor, ToolRegistry,
};

/// Agent 构建器：统一配置和初始化 Agent 的各个组件
pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    memory: Option<Arc<dyn LongTermMemory>>,
    framing: Option<FramingTemplate>,
    extra_tools: Vec<Arc<dyn Tool>>,
    enable_tasks: bool,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            memory: None,
            framing: None,
            extra_tools: Vec::new(),
            enable_tasks: true,
        }
    }

    /// 指定后端（否则按配置与环境变量选择）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_framing(mut self, framing: FramingTemplate) -> Self {
        self.framing = Some(framing);
        self
    }

    /// 追加一个内置工具之外的工具；同名时覆盖内置工具
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// 是否启用后台任务（关闭时不创建任务目录，也不注册任务工具）
    pub fn with_tasks(mut self, enable: bool) -> Self {
        self.enable_tasks = enable;
        self
    }

    fn work_dir(&self) -> PathBuf {
        self.config
            .app
            .work_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn build_memory(&self) -> Arc<dyn LongTermMemory> {
        let max = self.config.memory.max_entries;
        match &self.config.memory.path {
            Some(path) if !path.as_os_str().is_empty() => Arc::new(FileLongTerm::open(path, max)),
            _ => Arc::new(InMemoryLongTerm::new(max)),
        }
    }

    /// 构建统一的工具注册表
    pub fn build_tool_registry(
        &self,
        sessions: &Arc<SessionRegistry>,
        tasks: Option<&Arc<TaskManager>>,
    ) -> ToolRegistry {
        let tools_cfg = &self.config.tools;
        let work_dir = self.work_dir();
        let registry = ToolRegistry::new();

        registry.register(EchoTool);
        registry.register(SysInfoTool);
        registry.register(
            ExecTool::new(
                tools_cfg.allowed_commands.clone(),
                tools_cfg.exec_timeout_secs,
                tools_cfg.exec_max_timeout_secs,
                tools_cfg.max_output_chars,
            )
            .with_default_dir(&work_dir),
        );
        registry.register(FsListTool::new(&work_dir, tools_cfg.list_limit));
        registry.register(FsReadTool::new(&work_dir, tools_cfg.max_output_chars));
        registry.register(FsWriteTool::new(&work_dir));
        registry.register(FsSearchTool::new(&work_dir));
        registry.register(FsDeleteTool::new(&work_dir));
        registry.register(SessionControlTool::new(Arc::clone(sessions)));

        if let Some(manager) = tasks {
            registry.register(StartTaskTool::new(Arc::clone(manager)));
            registry.register(CheckTaskTool::new(Arc::clone(manager)));
            registry.register(KillTaskTool::new(Arc::clone(manager)));
            registry.register(ScheduleTaskTool::new(Arc::clone(manager)));
        }

        for tool in &self.extra_tools {
            registry.register_arc(Arc::clone(tool));
        }
        registry
    }

    /// 构建 Agent：打开任务账本（恢复未结束的任务）、注册工具、加载 framing 模板
    pub fn build(self) -> Result<Agent, AgentError> {
        if self.config.agent.max_steps == 0 {
            return Err(AgentError::ConfigError("agent.max_steps must be at least 1".into()));
        }
        let sessions = Arc::new(SessionRegistry::new());
        let tasks = if self.enable_tasks {
            Some(TaskManager::open(
                &self.config.tasks.dir,
                self.config.tasks.log_tail_bytes,
            )?)
        } else {
            None
        };

        let registry = Arc::new(self.build_tool_registry(&sessions, tasks.as_ref()));
        tracing::info!(tools = ?registry.tool_names(), "capability registry ready");

        let llm = self
            .llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config));
        let memory = self.memory.clone().unwrap_or_else(|| self.build_memory());
        let framing = match self.framing.clone() {
            Some(f) => f,
            None => FramingTemplate::load(
                &self.config.app.prompt_path,
                &self.work_dir(),
                self.config.app.security_level.clone(),
            ),
        };
        let agent_cfg = &self.config.agent;
        Ok(Agent {
            llm,
            executor: ToolExecutor::new(registry, self.config.tools.tool_timeout_secs),
            sessions,
            framing,
            memory,
            tasks,
            max_steps: agent_cfg.max_steps,
            context_window: agent_cfg.context_window.max(2),
            memory_timeout: Duration::from_secs(agent_cfg.memory_timeout_secs),
        })
    }
}
