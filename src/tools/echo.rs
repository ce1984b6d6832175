//! Echo 工具（诊断与测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::{args_schema, parse_args};
use crate::tools::{Tool, ToolContext};

#[derive(Deserialize, JsonSchema)]
struct EchoArgs {
    /// Text to echo back.
    text: String,
}

/// Echo 工具：原样返回 text
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back unchanged (diagnostics)."
    }

    fn parameters_schema(&self) -> Value {
        args_schema::<EchoArgs>()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<String, String> {
        let args: EchoArgs = parse_args(args)?;
        Ok(args.text)
    }
}
