//! 执行计划类型
//!
//! 计划由模型给出（TaskSpec 列表），在进入调度前校验：Agent 存在、依赖可解析、id 不重复、
//! 最多一个综合任务、依赖图无环。校验通过的 ExecutionPlan 只由执行器修改任务状态。

use std::collections::{BTreeMap, BTreeSet, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::graph::DependencyGraph;

/// 任务 ID：会话内单调递增
pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 模型给出的单个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskSpec {
    /// 任务 ID（取自任务分解阶段分配的 id）
    pub task_id: TaskId,
    /// 任务描述
    pub task: String,
    /// 执行该任务的 Agent 名（必须来自可用 Agent 列表）
    pub agent: String,
    /// 依赖的任务 ID
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

impl TaskSpec {
    pub fn new(task_id: TaskId, task: impl Into<String>, agent: impl Into<String>, dependencies: &[TaskId]) -> Self {
        Self {
            task_id,
            task: task.into(),
            agent: agent.into(),
            dependencies: dependencies.to_vec(),
        }
    }
}

/// 计划中的任务
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub agent: String,
    pub dependencies: BTreeSet<TaskId>,
    pub status: TaskStatus,
    pub result: Option<Value>,
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        Self {
            id: spec.task_id,
            description: spec.task,
            agent: spec.agent,
            dependencies: spec.dependencies.into_iter().collect(),
            status: TaskStatus::Pending,
            result: None,
        }
    }
}

/// 单个任务执行结果（Registry 边界之后不会再有异常）
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed { error: String },
}

/// 计划校验错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Execution plan is empty")]
    EmptyPlan,

    #[error("Duplicate task id {0}")]
    DuplicateTaskId(TaskId),

    #[error("Task {task_id} names unknown agent '{agent}'")]
    UnknownAgent { task_id: TaskId, agent: String },

    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: TaskId, dependency: TaskId },

    #[error("More than one synthesis task: {0:?}")]
    DuplicateSynthesis(Vec<TaskId>),

    #[error("Circular dependency among tasks {pending:?}")]
    CyclicDependency { pending: Vec<TaskId> },
}

/// 计划校验需要的 Agent 信息
pub trait AgentCatalog {
    fn has_agent(&self, name: &str) -> bool;
    fn is_synthesis(&self, name: &str) -> bool;
}

/// 已校验的执行计划
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    tasks: BTreeMap<TaskId, Task>,
    synthesis: Option<TaskId>,
}

impl ExecutionPlan {
    /// 校验并构建；prior_completed 为之前轮次已完成的任务 id（同 id 以本计划为准）
    pub fn build(
        specs: Vec<TaskSpec>,
        catalog: &dyn AgentCatalog,
        prior_completed: &HashSet<TaskId>,
    ) -> Result<Self, WorkflowError> {
        if specs.is_empty() {
            return Err(WorkflowError::EmptyPlan);
        }

        let mut tasks: BTreeMap<TaskId, Task> = BTreeMap::new();
        for spec in specs {
            if !catalog.has_agent(&spec.agent) {
                return Err(WorkflowError::UnknownAgent {
                    task_id: spec.task_id,
                    agent: spec.agent,
                });
            }
            if tasks.contains_key(&spec.task_id) {
                return Err(WorkflowError::DuplicateTaskId(spec.task_id));
            }
            tasks.insert(spec.task_id, Task::from(spec));
        }

        for task in tasks.values() {
            for dep in &task.dependencies {
                if !tasks.contains_key(dep) && !prior_completed.contains(dep) {
                    return Err(WorkflowError::UnknownDependency {
                        task_id: task.id,
                        dependency: *dep,
                    });
                }
            }
        }

        let synthesis: Vec<TaskId> = tasks
            .values()
            .filter(|t| catalog.is_synthesis(&t.agent))
            .map(|t| t.id)
            .collect();
        if synthesis.len() > 1 {
            return Err(WorkflowError::DuplicateSynthesis(synthesis));
        }

        let plan = Self {
            synthesis: synthesis.first().copied(),
            tasks,
        };
        DependencyGraph::from_tasks(plan.tasks.values()).waves()?;
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn synthesis_task(&self) -> Option<TaskId> {
        self.synthesis
    }

    /// 最大的任务 id（无综合任务时以它的结果为准）
    pub fn last_task(&self) -> Option<TaskId> {
        self.tasks.keys().next_back().copied()
    }

    /// 依赖是否已满足：计划内的依赖看状态，计划外的看之前轮次
    pub fn dependency_satisfied(&self, dep: TaskId, prior_completed: &HashSet<TaskId>) -> bool {
        match self.tasks.get(&dep) {
            Some(t) => t.status == TaskStatus::Completed,
            None => prior_completed.contains(&dep),
        }
    }

    /// 当前可执行的任务（升序）
    pub fn frontier(&self, prior_completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.dependencies
                    .iter()
                    .all(|d| self.dependency_satisfied(*d, prior_completed))
            })
            .map(|t| t.id)
            .collect()
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id)
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.values().all(|t| t.status == TaskStatus::Completed)
    }

    /// 人类可读的计划文本（供人工反馈）
    pub fn describe(&self) -> String {
        self.tasks
            .values()
            .map(|t| {
                let deps: Vec<String> = t.dependencies.iter().map(|d| d.to_string()).collect();
                format!(
                    "{}. [{}] {} (depends on: {})",
                    t.id,
                    t.agent,
                    t.description,
                    if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Catalog;

    impl AgentCatalog for Catalog {
        fn has_agent(&self, name: &str) -> bool {
            matches!(name, "Research" | "Weather" | "Synth")
        }
        fn is_synthesis(&self, name: &str) -> bool {
            name == "Synth"
        }
    }

    fn build(specs: Vec<TaskSpec>) -> Result<ExecutionPlan, WorkflowError> {
        ExecutionPlan::build(specs, &Catalog, &HashSet::new())
    }

    #[test]
    fn test_valid_plan_frontier() {
        let plan = build(vec![
            TaskSpec::new(1, "a", "Research", &[]),
            TaskSpec::new(2, "b", "Weather", &[]),
            TaskSpec::new(3, "c", "Synth", &[1, 2]),
        ])
        .unwrap();
        assert_eq!(plan.synthesis_task(), Some(3));
        assert_eq!(plan.frontier(&HashSet::new()), vec![1, 2]);
        assert_eq!(plan.last_task(), Some(3));
    }

    #[test]
    fn test_rejects_unknown_agent() {
        let err = build(vec![TaskSpec::new(1, "a", "Ghost", &[])]).unwrap_err();
        assert_eq!(
            err,
            WorkflowError::UnknownAgent { task_id: 1, agent: "Ghost".into() }
        );
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let err = build(vec![TaskSpec::new(2, "a", "Research", &[9])]).unwrap_err();
        assert_eq!(err, WorkflowError::UnknownDependency { task_id: 2, dependency: 9 });
    }

    #[test]
    fn test_prior_round_dependency_accepted() {
        let prior: HashSet<TaskId> = [4].into_iter().collect();
        let plan = ExecutionPlan::build(
            vec![TaskSpec::new(5, "a", "Synth", &[4])],
            &Catalog,
            &prior,
        )
        .unwrap();
        assert_eq!(plan.frontier(&prior), vec![5]);
        assert!(plan.frontier(&HashSet::new()).is_empty());
    }

    #[test]
    fn test_rejects_duplicate_synthesis_and_ids() {
        let err = build(vec![
            TaskSpec::new(1, "a", "Synth", &[]),
            TaskSpec::new(2, "b", "Synth", &[]),
        ])
        .unwrap_err();
        assert_eq!(err, WorkflowError::DuplicateSynthesis(vec![1, 2]));

        let err = build(vec![
            TaskSpec::new(1, "a", "Research", &[]),
            TaskSpec::new(1, "b", "Weather", &[]),
        ])
        .unwrap_err();
        assert_eq!(err, WorkflowError::DuplicateTaskId(1));
    }

    #[test]
    fn test_rejects_cycle_and_empty() {
        let err = build(vec![
            TaskSpec::new(1, "a", "Research", &[2]),
            TaskSpec::new(2, "b", "Research", &[1]),
        ])
        .unwrap_err();
        assert_eq!(err, WorkflowError::CyclicDependency { pending: vec![1, 2] });
        assert_eq!(build(vec![]).unwrap_err(), WorkflowError::EmptyPlan);
    }

    #[test]
    fn test_describe_lists_dependencies() {
        let plan = build(vec![
            TaskSpec::new(1, "weather", "Weather", &[]),
            TaskSpec::new(2, "answer", "Synth", &[1]),
        ])
        .unwrap();
        let text = plan.describe();
        assert!(text.contains("1. [Weather] weather (depends on: -)"));
        assert!(text.contains("2. [Synth] answer (depends on: 1)"));
    }
}
