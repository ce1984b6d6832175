//! 工具参数 Schema 生成与解析（schemars 自动生成工具 Schema）
//!
//! 内置工具用带 JsonSchema 的参数结构体描述参数，parameters_schema 由 schemars 生成，
//! execute 时用 serde 反序列化；反序列化失败即工具失败，交由模型下一轮自行修正。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 参数结构体的 JSON Schema（去掉 $schema / title 等与调用无关的字段）
pub fn args_schema<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({"type": "object", "properties": {}})
    });
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 将 JSON 参数解析为结构体；null 视为空对象
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    let args = if args.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[allow(dead_code)]
    #[derive(Debug, Deserialize, JsonSchema)]
    struct Demo {
        /// path to list
        path: String,
        #[serde(default)]
        recursive: bool,
    }

    #[test]
    fn test_schema_lists_properties() {
        let schema = args_schema::<Demo>();
        assert!(schema["properties"]["path"].is_object());
        assert!(schema.get("$schema").is_none());
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "path"));
    }

    #[test]
    fn test_parse_args_error_is_readable() {
        let r: Result<Demo, String> = parse_args(serde_json::json!({"recursive": true}));
        assert!(r.unwrap_err().contains("invalid arguments"));
    }
}
