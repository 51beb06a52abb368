//! 专家 Agent：统一接口 + 注册表 + 具体实现
//!
//! - **registry**: 名称 -> Agent、每 Agent 的工具授权、会话内任务 id 计数、执行边界（失败不外泄）
//! - **tool_agent**: 通用的思考-行动专家（研究、天气等）
//! - **decomposer**: 任务分解，给子任务分配 id 并征求人工反馈
//! - **synthesizer**: 综合角色，产出最终回答

pub mod decomposer;
pub mod registry;
pub mod synthesizer;
pub mod tool_agent;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::core::{HiveError, SessionScope};
use crate::workflow::{Task, TaskId};

pub use decomposer::TaskDecomposer;
pub use registry::{AgentInfo, AgentRegistry};
pub use synthesizer::ResponseSynthesizer;
pub use tool_agent::ToolAgent;

/// 综合角色的能力标签；一个计划里最多一个任务的 Agent 带这个标签
pub const SYNTHESIS_CAPABILITY: &str = "synthesis";
pub const DECOMPOSITION_CAPABILITY: &str = "decomposition";

/// 已完成依赖任务的输出
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyOutput {
    pub task_id: TaskId,
    pub agent: String,
    pub task: String,
    pub result: Value,
}

/// Agent 执行时可用的会话资源
pub struct AgentCx<'a> {
    pub session: &'a SessionScope,
    pub registry: &'a AgentRegistry,
}

/// 专家 Agent
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 能力标签（如 synthesis）
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// 执行一个任务；错误由 AgentRegistry 转为 TaskOutcome::Failed
    async fn execute(
        &self,
        cx: &AgentCx<'_>,
        task: &Task,
        dependencies: &[DependencyOutput],
    ) -> Result<Value, HiveError>;
}

/// 结果值转为提示词文本
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// 依赖输出渲染为提示词片段
pub fn render_dependencies(dependencies: &[DependencyOutput]) -> String {
    dependencies
        .iter()
        .map(|d| format!("[task {} by {}] {}\n{}\n", d.task_id, d.agent, d.task, value_text(&d.result)))
        .collect()
}

pub(crate) fn dependency_ids(dependencies: &[DependencyOutput]) -> Vec<TaskId> {
    dependencies.iter().map(|d| d.task_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_dependencies() {
        let deps = vec![DependencyOutput {
            task_id: 2,
            agent: "WeatherExpert".into(),
            task: "weather in London".into(),
            result: json!("12°C, cloudy"),
        }];
        let text = render_dependencies(&deps);
        assert!(text.starts_with("[task 2 by WeatherExpert] weather in London\n12°C, cloudy"));
        assert_eq!(dependency_ids(&deps), vec![2]);
        assert_eq!(value_text(&json!(null)), "");
    }
}
