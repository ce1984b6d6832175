//! session_control：列出 / 取消进行中的会话
//!
//! 只经过 SessionRegistry 的读锁与取消令牌，不触碰任何会话的转录锁，
//! 因此会话可以安全地取消自身。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::core::SessionRegistry;
use crate::tools::schema::{args_schema, parse_args};
use crate::tools::{Tool, ToolContext};

#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum Action {
    List,
    Cancel,
}

#[derive(Deserialize, JsonSchema)]
struct ControlArgs {
    /// 'list' to show live sessions, 'cancel' to stop one.
    action: Action,
    /// Session to cancel (e.g. TSK-0001A). Not needed for 'list'.
    #[serde(default)]
    session_id: Option<String>,
}

pub struct SessionControlTool {
    registry: Arc<SessionRegistry>,
}

impl SessionControlTool {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for SessionControlTool {
    fn name(&self) -> &str {
        "session_control"
    }

    fn description(&self) -> &str {
        "Manage the agent's own concurrent sessions: 'list' the live TSK-... sessions or 'cancel' a stuck or unwanted one by id."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<ControlArgs>()
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: ControlArgs = parse_args(args)?;
        match args.action {
            Action::List => {
                let sessions = self.registry.list();
                let others = sessions.iter().filter(|s| s.id != ctx.session_id).count();
                if others == 0 {
                    return Ok("No other sessions are running.".to_string());
                }
                let mut out = String::from("Live sessions:\n");
                for s in &sessions {
                    let marker = if s.id == ctx.session_id { " (this session)" } else { "" };
                    out.push_str(&format!(
                        "- {} (started {}){}\n",
                        s.id,
                        s.created_at.format("%H:%M:%S"),
                        marker
                    ));
                }
                Ok(out)
            }
            Action::Cancel => {
                let id = args
                    .session_id
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| "session_id is required for cancel".to_string())?;
                self.registry.cancel(&id).map_err(|_| {
                    format!("session '{id}' not found; it may have already finished or been cancelled")
                })?;
                Ok(format!("Cancel signal sent to [{id}]. The session is stopping."))
            }
        }
    }
}
