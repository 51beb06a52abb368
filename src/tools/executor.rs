//! 工具执行器
//!
//! 持有 ToolRegistry 与单次调用超时。call_tool 先校验参数，再在超时内执行；
//! 失败映射为 HiveError（ToolNotFound / MissingRequiredParameter / ToolExecutionFailed / ToolTimeout）。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::HiveError;
use crate::react::parser::truncate;
use crate::tools::registry::{prepare_args, Tool, ToolRegistry};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 按名调用工具，返回原始结果
    pub async fn call_tool(&self, tool_name: &str, args: Value) -> Result<String, HiveError> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| HiveError::ToolNotFound(tool_name.to_string()))?;
        self.run(tool, args).await
    }

    /// 以 Agent 身份调用：只允许已授权的工具
    pub async fn call_as(&self, agent: &str, tool_name: &str, args: Value) -> Result<String, HiveError> {
        if !self.registry.is_granted(agent, tool_name) {
            return Err(HiveError::ToolNotFound(tool_name.to_string()));
        }
        self.call_tool(tool_name, args).await
    }

    async fn run(&self, tool: Arc<dyn Tool>, args: Value) -> Result<String, HiveError> {
        let start = Instant::now();
        let args_preview = truncate(&args.to_string(), 200);
        let tool_name = tool.name().to_string();

        let result = match prepare_args(tool.as_ref(), args) {
            Ok(args) => match timeout(self.timeout, tool.execute(args)).await {
                Ok(Ok(content)) => Ok(content),
                Ok(Err(e)) => Err(HiveError::ToolExecutionFailed(e)),
                Err(_) => Err(HiveError::ToolTimeout(tool_name.clone())),
            },
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(HiveError::MissingRequiredParameter { .. }) => "invalid_args",
            Err(HiveError::ToolTimeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(target: "tool_audit", audit = %audit, "tool call");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{FnTool, ParamSpec};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn executor() -> ToolExecutor {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(Arc::new(FnTool::new(
                "shout",
                "uppercase",
                vec![ParamSpec::required("text", "string", "text")],
                |a| Ok(a["text"].as_str().unwrap_or("").to_uppercase()),
            )))
            .unwrap();
        registry
            .register(Arc::new(FnTool::new("fail", "always fails", vec![], |_| {
                Err("boom".to_string())
            })))
            .unwrap();
        registry.register(Arc::new(SlowTool)).unwrap();
        registry.grant("A", "shout").unwrap();
        ToolExecutor::new(registry, 1)
    }

    #[tokio::test]
    async fn test_call_tool_outcomes() {
        let ex = executor();
        assert_eq!(ex.call_tool("shout", json!({"text": "hi"})).await.unwrap(), "HI");
        assert!(matches!(
            ex.call_tool("shout", json!({})).await,
            Err(HiveError::MissingRequiredParameter { .. })
        ));
        assert!(matches!(
            ex.call_tool("fail", json!({})).await,
            Err(HiveError::ToolExecutionFailed(ref m)) if m == "boom"
        ));
        assert!(matches!(
            ex.call_tool("missing", json!({})).await,
            Err(HiveError::ToolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let ex = executor();
        assert!(matches!(
            ex.call_tool("slow", json!({})).await,
            Err(HiveError::ToolTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_call_as_respects_grants() {
        let ex = executor();
        assert!(ex.call_as("A", "shout", json!({"text": "x"})).await.is_ok());
        assert!(matches!(
            ex.call_as("A", "fail", json!({})).await,
            Err(HiveError::ToolNotFound(_))
        ));
    }
}
