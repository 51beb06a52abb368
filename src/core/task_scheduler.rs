//! 波次调度：按依赖图分波并发执行计划
//!
//! 每一波取 frontier（Pending 且依赖全部满足的任务），全部并发执行，等整波结束再算下一波。
//! 综合任务一完成立即返回其结果；没有综合任务时全部完成后返回 id 最大的任务结果。
//! frontier 为空而计划未完成：有失败任务时是停滞（Stalled），否则是依赖环。

use std::collections::{BTreeMap, HashSet};

use futures_util::future::join_all;
use serde_json::Value;

use crate::agents::{AgentRegistry, DependencyOutput};
use crate::core::{HiveError, SessionScope};
use crate::workflow::{ExecutionPlan, TaskId, TaskOutcome, TaskStatus};

/// 会话内已完成任务的输出（跨规划轮次保留）
pub type CompletedTasks = BTreeMap<TaskId, DependencyOutput>;

#[derive(Debug, Clone, PartialEq)]
pub enum WaveOutcome {
    /// 综合任务完成
    Synthesized { task_id: TaskId, result: Value },
    /// 没有综合任务，所有任务完成
    Finished { task_id: TaskId, result: Value },
    /// 有任务失败，剩余任务无法调度
    Stalled { failed: Vec<(TaskId, String)>, pending: Vec<TaskId> },
    /// 会话迭代预算用完，剩余任务未执行
    BudgetExhausted { pending: Vec<TaskId> },
}

#[derive(Debug, Clone)]
pub struct ScheduleReport {
    pub outcome: WaveOutcome,
    /// 实际执行的波次（每波任务 id 升序）
    pub waves: Vec<Vec<TaskId>>,
}

pub struct TaskScheduler<'a> {
    registry: &'a AgentRegistry,
    session: &'a SessionScope,
}

impl<'a> TaskScheduler<'a> {
    pub fn new(registry: &'a AgentRegistry, session: &'a SessionScope) -> Self {
        Self { registry, session }
    }

    /// 执行计划；completed 里是之前轮次完成的任务，本轮完成的任务也会写进去
    pub async fn run(&self, plan: &mut ExecutionPlan, completed: &mut CompletedTasks) -> Result<ScheduleReport, HiveError> {
        let mut waves: Vec<Vec<TaskId>> = Vec::new();
        let mut failures: Vec<(TaskId, String)> = Vec::new();

        loop {
            let prior: HashSet<TaskId> = completed.keys().copied().collect();
            let frontier = plan.frontier(&prior);

            if frontier.is_empty() {
                if plan.all_completed() {
                    let task_id = plan
                        .last_task()
                        .ok_or_else(|| HiveError::InvalidPlan("empty plan".to_string()))?;
                    let result = plan.get(task_id).and_then(|t| t.result.clone()).unwrap_or(Value::Null);
                    return Ok(ScheduleReport {
                        outcome: WaveOutcome::Finished { task_id, result },
                        waves,
                    });
                }
                let pending = plan.ids_with_status(TaskStatus::Pending);
                if failures.is_empty() {
                    tracing::error!(?pending, "no schedulable task and nothing failed: circular dependency");
                    return Err(HiveError::CircularDependency { pending });
                }
                tracing::warn!(?pending, failed = failures.len(), "plan stalled on failed dependencies");
                return Ok(ScheduleReport {
                    outcome: WaveOutcome::Stalled { failed: failures, pending },
                    waves,
                });
            }

            if self.session.budget_exhausted() {
                return Ok(ScheduleReport {
                    outcome: WaveOutcome::BudgetExhausted {
                        pending: plan.ids_with_status(TaskStatus::Pending),
                    },
                    waves,
                });
            }

            tracing::info!(wave = waves.len() + 1, tasks = ?frontier, "executing wave");
            let mut jobs = Vec::with_capacity(frontier.len());
            for id in &frontier {
                let Some(task) = plan.get_mut(*id) else { continue };
                task.status = TaskStatus::Running;
                let task = task.clone();
                let deps: Vec<DependencyOutput> = task
                    .dependencies
                    .iter()
                    .filter_map(|d| completed.get(d).cloned())
                    .collect();
                let registry = self.registry;
                let session = self.session;
                jobs.push(async move {
                    let outcome = registry.execute(session, &task, &deps).await;
                    (task, outcome)
                });
            }
            let outcomes = join_all(jobs).await;
            waves.push(frontier);

            for (task, outcome) in outcomes {
                let Some(slot) = plan.get_mut(task.id) else { continue };
                match outcome {
                    TaskOutcome::Completed(result) => {
                        slot.status = TaskStatus::Completed;
                        slot.result = Some(result.clone());
                        completed.insert(
                            task.id,
                            DependencyOutput {
                                task_id: task.id,
                                agent: task.agent.clone(),
                                task: task.description.clone(),
                                result,
                            },
                        );
                    }
                    TaskOutcome::Failed { error } => {
                        slot.status = TaskStatus::Failed;
                        slot.result = Some(Value::String(error.clone()));
                        failures.push((task.id, error));
                    }
                }
            }

            if let Some(synthesis) = plan.synthesis_task() {
                if let Some(task) = plan.get(synthesis).filter(|t| t.status == TaskStatus::Completed) {
                    let result = task.result.clone().unwrap_or(Value::Null);
                    tracing::info!(task_id = synthesis, waves = waves.len(), "synthesis task completed");
                    return Ok(ScheduleReport {
                        outcome: WaveOutcome::Synthesized {
                            task_id: synthesis,
                            result,
                        },
                        waves,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, AgentCx, SYNTHESIS_CAPABILITY};
    use crate::core::SessionLimits;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::{InMemoryDurableLog, InMemoryRecentCache, MemoryManager, MemoryPolicy, NoopIndex};
    use crate::tools::{ToolExecutor, ToolRegistry};
    use crate::workflow::{PlanBuilder, Task};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// 返回 "<agent>:<task id>"，并记录执行顺序
    struct Worker {
        name: &'static str,
        synthesis: bool,
        fail_on: Option<TaskId>,
        log: Arc<Mutex<Vec<TaskId>>>,
    }

    #[async_trait]
    impl Agent for Worker {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test worker"
        }
        fn capabilities(&self) -> Vec<String> {
            if self.synthesis {
                vec![SYNTHESIS_CAPABILITY.to_string()]
            } else {
                Vec::new()
            }
        }
        async fn execute(&self, _: &AgentCx<'_>, task: &Task, deps: &[DependencyOutput]) -> Result<Value, HiveError> {
            self.log.lock().unwrap().push(task.id);
            if self.fail_on == Some(task.id) {
                return Err(HiveError::ToolExecutionFailed("boom".into()));
            }
            let inputs: Vec<TaskId> = deps.iter().map(|d| d.task_id).collect();
            Ok(json!({"by": format!("{}:{}", self.name, task.id), "inputs": inputs}))
        }
    }

    struct Fixture {
        registry: AgentRegistry,
        scope: SessionScope,
        log: Arc<Mutex<Vec<TaskId>>>,
    }

    fn fixture(fail_on: Option<TaskId>) -> Fixture {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = AgentRegistry::new(Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()), 5)));
        registry.register(
            Arc::new(Worker { name: "W", synthesis: false, fail_on, log: log.clone() }),
            vec![],
        );
        registry.register(
            Arc::new(Worker { name: "S", synthesis: true, fail_on: None, log: log.clone() }),
            vec![],
        );
        let memory = Arc::new(MemoryManager::new(
            Arc::new(InMemoryRecentCache::new(10)),
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(NoopIndex),
            Arc::new(ScriptedLlmClient::new()),
            MemoryPolicy::default(),
        ));
        let scope = SessionScope::new("s1", "q", memory, SessionLimits::default());
        Fixture { registry, scope, log }
    }

    #[tokio::test]
    async fn test_synthesis_returns_immediately() {
        let f = fixture(None);
        // 任务 4 没有依赖但 id 更大：综合任务完成后不再执行
        let mut plan = PlanBuilder::new()
            .task(1, "a", "W")
            .task(2, "b", "W")
            .task(3, "combine", "S")
            .depends_on(3, &[1, 2])
            .task(4, "late", "W")
            .depends_on(4, &[3])
            .build(&f.registry, &HashSet::new())
            .unwrap();
        let mut completed = CompletedTasks::new();
        let report = TaskScheduler::new(&f.registry, &f.scope)
            .run(&mut plan, &mut completed)
            .await
            .unwrap();

        assert_eq!(report.waves, vec![vec![1, 2], vec![3]]);
        assert_eq!(
            report.outcome,
            WaveOutcome::Synthesized {
                task_id: 3,
                result: json!({"by": "S:3", "inputs": [1, 2]})
            }
        );
        assert_eq!(plan.get(4).unwrap().status, TaskStatus::Pending);
        assert_eq!(completed.len(), 3);
    }

    #[tokio::test]
    async fn test_without_synthesis_returns_greatest_id() {
        let f = fixture(None);
        let mut plan = PlanBuilder::new()
            .task(1, "a", "W")
            .task(2, "b", "W")
            .then(1, 2)
            .task(5, "c", "W")
            .build(&f.registry, &HashSet::new())
            .unwrap();
        let mut completed = CompletedTasks::new();
        let report = TaskScheduler::new(&f.registry, &f.scope)
            .run(&mut plan, &mut completed)
            .await
            .unwrap();
        // 波次数等于最长依赖链
        assert_eq!(report.waves, vec![vec![1, 5], vec![2]]);
        assert!(matches!(report.outcome, WaveOutcome::Finished { task_id: 5, .. }));
    }

    #[tokio::test]
    async fn test_failed_dependency_stalls() {
        let f = fixture(Some(1));
        let mut plan = PlanBuilder::new()
            .task(1, "a", "W")
            .task(2, "b", "W")
            .task(3, "combine", "S")
            .depends_on(3, &[1, 2])
            .build(&f.registry, &HashSet::new())
            .unwrap();
        let mut completed = CompletedTasks::new();
        let report = TaskScheduler::new(&f.registry, &f.scope)
            .run(&mut plan, &mut completed)
            .await
            .unwrap();

        // 兄弟任务不受影响
        assert_eq!(plan.get(2).unwrap().status, TaskStatus::Completed);
        match report.outcome {
            WaveOutcome::Stalled { failed, pending } => {
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, 1);
                assert_eq!(pending, vec![3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prior_round_results_feed_dependencies() {
        let f = fixture(None);
        let mut completed = CompletedTasks::new();
        completed.insert(
            7,
            DependencyOutput {
                task_id: 7,
                agent: "W".into(),
                task: "earlier".into(),
                result: json!("old"),
            },
        );
        let prior: HashSet<TaskId> = completed.keys().copied().collect();
        let mut plan = PlanBuilder::new()
            .task(8, "combine", "S")
            .depends_on(8, &[7])
            .build(&f.registry, &prior)
            .unwrap();
        let report = TaskScheduler::new(&f.registry, &f.scope)
            .run(&mut plan, &mut completed)
            .await
            .unwrap();
        assert_eq!(
            report.outcome,
            WaveOutcome::Synthesized {
                task_id: 8,
                result: json!({"by": "S:8", "inputs": [7]})
            }
        );
    }
}
