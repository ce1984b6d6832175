//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找；
//! 注册即覆盖同名工具。list() 按名称排序，保证每轮发给后端的工具列表稳定。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// 工具执行上下文：所属会话与其取消令牌
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub session_id: String,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel,
        }
    }

    /// 与任何会话无关的上下文（测试、CLI 直接调用）
    pub fn detached() -> Self {
        Self::new("-", CancellationToken::new())
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；阻塞操作须响应 ctx.cancel
    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String>;
}

/// 工具注册表：线程安全，读多写少
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或替换同名工具
    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let replaced = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), tool)
            .is_some();
        if replaced {
            tracing::debug!(tool = %name, "tool replaced");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// 按名称排序的工具列表
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        let mut list: Vec<Arc<dyn Tool>> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.list().iter().map(|t| t.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 工具 schema JSON（name / description / parameters），按名称排序
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .list()
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            self.1
        }

        async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<String, String> {
            Ok(self.1.to_string())
        }
    }

    #[test]
    fn test_register_replaces_same_name() {
        let registry = ToolRegistry::new();
        registry.register(Named("fs_list", "first"));
        registry.register(Named("fs_list", "second"));

        let list = registry.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].description(), "second");
    }

    #[test]
    fn test_list_sorted_by_name() {
        let registry = ToolRegistry::new();
        registry.register(Named("sys_exec", ""));
        registry.register(Named("check_task", ""));
        registry.register(Named("fs_list", ""));

        assert_eq!(registry.tool_names(), vec!["check_task", "fs_list", "sys_exec"]);
    }

    #[test]
    fn test_get_missing() {
        let registry = ToolRegistry::new();
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_concurrent_register_and_lookup() {
        let registry = Arc::new(ToolRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let name: &'static str = Box::leak(format!("tool_{}", i % 4).into_boxed_str());
                    r.register(Named(name, "d"));
                    r.list().len()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap() >= 1);
        }
        assert_eq!(registry.len(), 4);
    }
}
