//! Echo 工具（测试与离线演示用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::registry::{ParamSpec, Tool};

/// 回显 text 参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text back unchanged."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required("text", "string", "Text to echo")]
    }

    fn return_description(&self) -> &str {
        "The same text"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        Ok(args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }
}
