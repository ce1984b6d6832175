//! Framing（system）消息的构建
//!
//! 模板来自 app.prompt_path，占位符：{year}、{work_dir}、{security_level}、{tools}。
//! 每一轮都重新渲染，以反映当前注册的工具。

use std::path::Path;
use std::sync::Arc;

use chrono::Datelike;

use crate::tools::Tool;

const DEFAULT_TEMPLATE: &str = "\
You are drone, an autonomous operator running on the user's machine. Current year: {year}.

Working directory: {work_dir}
Security level: {security_level}

Available capabilities:
{tools}

Rules:
- Call a capability whenever you need facts from the system; never invent output.
- Use start_task for anything that may run longer than a minute, then follow it with check_task.
- When a capability fails, read the error, fix the arguments and try again.
- When the task is done, answer in plain text without calling any capability.";

/// framing 模板：加载一次，按轮渲染
#[derive(Debug, Clone)]
pub struct FramingTemplate {
    template: String,
    work_dir: String,
    security_level: String,
}

impl FramingTemplate {
    pub fn new(template: impl Into<String>, work_dir: &Path, security_level: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            work_dir: format!(
                "{} ({} / {})",
                work_dir.display(),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            security_level: security_level.into(),
        }
    }

    /// 读取模板文件；缺失时使用内置模板并告警
    pub fn load(path: &Path, work_dir: &Path, security_level: impl Into<String>) -> Self {
        let template = match std::fs::read_to_string(path) {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) | Err(_) => {
                tracing::warn!(path = %path.display(), "framing template not found, using built-in default");
                DEFAULT_TEMPLATE.to_string()
            }
        };
        Self::new(template, work_dir, security_level)
    }

    pub fn builtin(work_dir: &Path) -> Self {
        Self::new(DEFAULT_TEMPLATE, work_dir, "standard")
    }

    /// 渲染 framing 文本；工具按注册表顺序（已排序）列出
    pub fn render(&self, tools: &[Arc<dyn Tool>]) -> String {
        let tool_lines = if tools.is_empty() {
            "(none)".to_string()
        } else {
            tools
                .iter()
                .map(|t| format!("- {}: {}", t.name(), t.description()))
                .collect::<Vec<_>>()
                .join("\n")
        };
        self.template
            .replace("{year}", &chrono::Local::now().year().to_string())
            .replace("{work_dir}", &self.work_dir)
            .replace("{security_level}", &self.security_level)
            .replace("{tools}", &tool_lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_render_fills_placeholders() {
        let t = FramingTemplate::new(
            "y={year} d={work_dir} s={security_level}\n{tools}",
            Path::new("/srv/work"),
            "restricted",
        );
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let text = t.render(&tools);
        assert!(text.contains("/srv/work ("));
        assert!(text.contains("s=restricted"));
        assert!(text.contains("- echo: "));
        assert!(!text.contains("{year}"));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let t = FramingTemplate::load(Path::new("/nonexistent/prompt.md"), Path::new("."), "standard");
        assert!(t.render(&[]).contains("Available capabilities:\n(none)"));
    }
}
