//! 编排错误类型
//!
//! Registry / 调度器 / 编排器共用的错误分类。Agent 与工具的失败在 Registry 边界被转为
//! TaskOutcome::Failed，不会越过该边界；真正致命的只有 OracleUnavailable 与 RetriesExhausted。

use thiserror::Error;

use crate::llm::LlmError;
use crate::memory::MemoryError;
use crate::workflow::{TaskId, WorkflowError};

/// 编排过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum HiveError {
    /// 模型输出中没有可解析的 JSON 块，或必需字段缺失/类型错误
    #[error("Malformed oracle response: {0}")]
    OracleMalformedResponse(String),

    /// 模型给出了未知的 action 名（既不是 Agent 也不是工具）
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} already granted to agent {agent}")]
    DuplicateTool { agent: String, tool: String },

    #[error("Missing required parameters for tool '{tool}': {}", params.join(", "))]
    MissingRequiredParameter { tool: String, params: Vec<String> },

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// Agent 用完迭代预算仍没有可用结果
    #[error("Agent {0} produced no result")]
    NoResult(String),

    /// 计划依赖图存在环（仅对当前计划致命）
    #[error("Circular dependency among tasks {pending:?}")]
    CircularDependency { pending: Vec<TaskId> },

    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),

    /// 模型不可达（重试耗尽后），会话中止
    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    #[error("Plan retries exhausted after {0} attempts")]
    RetriesExhausted(usize),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl HiveError {
    /// 是否为 Agent 调用工具时应当被吞掉、记为失败观察的错误
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            HiveError::ToolNotFound(_)
                | HiveError::MissingRequiredParameter { .. }
                | HiveError::ToolExecutionFailed(_)
                | HiveError::ToolTimeout(_)
        )
    }
}

impl From<LlmError> for HiveError {
    fn from(e: LlmError) -> Self {
        HiveError::OracleUnavailable(e.to_string())
    }
}

impl From<MemoryError> for HiveError {
    fn from(e: MemoryError) -> Self {
        HiveError::Backend(e.to_string())
    }
}

impl From<WorkflowError> for HiveError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::CyclicDependency { pending } => HiveError::CircularDependency { pending },
            other => HiveError::InvalidPlan(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_param_message_lists_params() {
        let err = HiveError::MissingRequiredParameter {
            tool: "get_forecast".to_string(),
            params: vec!["city".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Missing required parameters for tool 'get_forecast': city"
        );
        assert!(err.is_tool_failure());
    }

    #[test]
    fn test_cycle_maps_from_workflow_error() {
        let err: HiveError = WorkflowError::CyclicDependency { pending: vec![1, 2] }.into();
        assert!(matches!(err, HiveError::CircularDependency { ref pending } if pending == &vec![1, 2]));
    }

    #[test]
    fn test_llm_error_is_fatal_oracle_error() {
        let err: HiveError = LlmError::Network("connection refused".to_string()).into();
        assert!(matches!(err, HiveError::OracleUnavailable(_)));
        assert!(!err.is_tool_failure());
    }
}
