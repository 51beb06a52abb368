//! 计划构建器
//!
//! 提供流畅的 API 手工拼装 TaskSpec 列表（测试与离线演示），最终仍走 ExecutionPlan::build 校验。

use std::collections::HashSet;

use crate::workflow::types::{AgentCatalog, ExecutionPlan, TaskId, TaskSpec, WorkflowError};

#[derive(Debug, Default, Clone)]
pub struct PlanBuilder {
    specs: Vec<TaskSpec>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加无依赖任务
    pub fn task(mut self, id: TaskId, description: impl Into<String>, agent: impl Into<String>) -> Self {
        self.specs.push(TaskSpec::new(id, description, agent, &[]));
        self
    }

    /// 设置任务的全部依赖（覆盖之前的设置）
    pub fn depends_on(mut self, id: TaskId, deps: &[TaskId]) -> Self {
        if let Some(spec) = self.specs.iter_mut().find(|s| s.task_id == id) {
            spec.dependencies = deps.to_vec();
        }
        self
    }

    /// 顺序依赖：to 依赖 from
    pub fn then(mut self, from: TaskId, to: TaskId) -> Self {
        if let Some(spec) = self.specs.iter_mut().find(|s| s.task_id == to) {
            if !spec.dependencies.contains(&from) {
                spec.dependencies.push(from);
            }
        }
        self
    }

    pub fn specs(self) -> Vec<TaskSpec> {
        self.specs
    }

    pub fn build(
        self,
        catalog: &dyn AgentCatalog,
        prior_completed: &HashSet<TaskId>,
    ) -> Result<ExecutionPlan, WorkflowError> {
        ExecutionPlan::build(self.specs, catalog, prior_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_wires_dependencies() {
        let specs = PlanBuilder::new()
            .task(1, "research", "Research")
            .task(2, "weather", "Weather")
            .task(3, "answer", "Synth")
            .depends_on(3, &[1])
            .then(2, 3)
            .specs();
        assert_eq!(specs[2].dependencies, vec![1, 2]);
        assert!(specs[0].dependencies.is_empty());
    }
}
