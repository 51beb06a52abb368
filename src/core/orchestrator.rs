//! 编排器：会话主循环
//!
//! 每轮先问规划模型下一步；拿到执行计划后校验、征求人工意见、按波次执行，
//! 结果交给质量闸门，合格后再征求一次人工意见，通过即完成。任何一步被否决都带着说明回到规划。
//! 循环在完成或迭代数达到上限时结束；上限耗尽时返回已有的最好结果。模型不可达或计划连续无效
//! 超过重试次数时以失败结束。run 从不返回错误。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

use crate::agents::{value_text, AgentRegistry, DependencyOutput};
use crate::core::state::{PhaseTracker, SessionPhase};
use crate::core::task_scheduler::{CompletedTasks, TaskScheduler, WaveOutcome};
use crate::core::{HiveError, SessionLimits, SessionScope};
use crate::feedback::{FeedbackGate, FeedbackResponse};
use crate::llm::LlmClient;
use crate::memory::{Iteration, IterationStatus, MemoryManager};
use crate::react::{Action, Critic, PlanRequest, Planner, Turn};
use crate::workflow::{ExecutionPlan, Task, TaskSpec, TaskStatus};

pub const ORCHESTRATOR_NAME: &str = "Orchestrator";

/// 规划提示词里带多少条历史迭代
const PLANNER_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub limits: SessionLimits,
    /// 连续无效（或有环）计划的重试次数
    pub max_plan_retries: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            limits: SessionLimits::default(),
            max_plan_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    /// 结果通过质量闸门且没有新的人工反馈
    Completed,
    /// 迭代上限耗尽，answer 是已有的最好结果
    Exhausted,
    /// 模型不可达或计划重试耗尽
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResult {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub answer: Option<String>,
    pub error: Option<String>,
    pub total_iterations: u64,
    pub phases: Vec<SessionPhase>,
    /// 本会话期间模型客户端新增的 (prompt, completion, total) token 数；
    /// 同一客户端上并发的会话会计入彼此
    pub token_usage: (u64, u64, u64),
}

enum End {
    Completed(String),
    Exhausted,
    Failed(HiveError),
}

enum PlanFlow {
    Replan,
    Candidate(String),
    Abort(End),
}

/// 单个会话的可变状态
#[derive(Default)]
struct RunState {
    phases: PhaseTracker,
    /// 带给下一轮规划的说明
    notes: Vec<String>,
    completed: CompletedTasks,
    best: Option<String>,
    plan_failures: usize,
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    memory: Arc<MemoryManager>,
    planner: Planner,
    critic: Critic,
    feedback: Arc<FeedbackGate>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        memory: Arc<MemoryManager>,
        oracle: Arc<dyn LlmClient>,
        feedback: Arc<FeedbackGate>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            planner: Planner::new(oracle.clone()),
            critic: Critic::new(oracle),
            feedback,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// 运行一个新会话
    pub async fn run(&self, user_query: &str) -> SessionResult {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.run_session(&session_id, user_query).await
    }

    /// 以指定 id 运行会话
    pub async fn run_session(&self, session_id: &str, user_query: &str) -> SessionResult {
        let span = tracing::info_span!("session", id = %session_id);
        self.run_inner(session_id, user_query).instrument(span).await
    }

    async fn run_inner(&self, session_id: &str, user_query: &str) -> SessionResult {
        tracing::info!(query = %user_query, "session started");
        let usage_before = self.planner.token_usage();
        if let Err(e) = self.memory.initialize_session(session_id, user_query).await {
            tracing::warn!(error = %e, "session bootstrap incomplete, continuing on available tiers");
        }
        let scope = SessionScope::new(session_id, user_query, self.memory.clone(), self.config.limits);
        let mut state = RunState::default();

        let end = self.drive(&scope, &mut state).await;

        let (outcome, answer, error) = match end {
            End::Completed(answer) => {
                if let Err(e) = self.memory.complete_session(session_id).await {
                    tracing::warn!(error = %e, "failed to mark session completed");
                }
                (SessionOutcome::Completed, Some(answer), None)
            }
            End::Exhausted => {
                tracing::warn!(total = scope.total_iterations(), "iteration cap reached, returning best available result");
                let best = state.best.clone().or_else(|| {
                    state
                        .completed
                        .values()
                        .next_back()
                        .map(|done| value_text(&done.result))
                });
                (SessionOutcome::Exhausted, best, None)
            }
            End::Failed(e) => {
                tracing::error!(error = %e, "session failed");
                (SessionOutcome::Failed, None, Some(e.to_string()))
            }
        };

        self.memory.flush().await;
        self.memory.release_session(session_id).await;
        self.registry.end_session(session_id);
        let usage_after = self.planner.token_usage();
        let token_usage = (
            usage_after.0.saturating_sub(usage_before.0),
            usage_after.1.saturating_sub(usage_before.1),
            usage_after.2.saturating_sub(usage_before.2),
        );
        tracing::info!(
            ?outcome,
            total = scope.total_iterations(),
            prompt_tokens = token_usage.0,
            completion_tokens = token_usage.1,
            total_tokens = token_usage.2,
            "session finished"
        );

        SessionResult {
            session_id: session_id.to_string(),
            outcome,
            answer,
            error,
            total_iterations: scope.total_iterations(),
            phases: state.phases.into_trace(),
            token_usage,
        }
    }

    async fn drive(&self, scope: &SessionScope, state: &mut RunState) -> End {
        loop {
            if scope.budget_exhausted() {
                return End::Exhausted;
            }
            if state.phases.current() != SessionPhase::Planning {
                state.phases.advance(SessionPhase::Planning);
            }

            let history = self.planner_history(scope, state).await;
            let agents = self.registry.describe_agents();
            let feedbacks = self.feedback.feedbacks_for(ORCHESTRATOR_NAME);
            let request = PlanRequest {
                user_query: scope.user_query(),
                agents: &agents,
                feedbacks: &feedbacks,
                history: &history,
                notes: &state.notes,
            };
            let turn = match self
                .planner
                .next_turn(request, |n| self.registry.has_agent(n), |n| self.registry.has_tool(n))
                .await
            {
                Ok(t) => t,
                Err(e) => return End::Failed(e),
            };
            let record = scope
                .iteration(ORCHESTRATOR_NAME)
                .with_thought(turn.thought.clone())
                .with_action(turn.action_name.clone(), turn.action_input.clone());

            match turn.turn {
                Turn::Think => {
                    scope.record(record.with_observation("not applicable")).await;
                }
                Turn::Unknown(name) => {
                    let err = HiveError::UnknownAction(name);
                    tracing::warn!(error = %err, "planner chose an unknown action");
                    let note = format!("{}. Use only the listed agents or an execution plan.", err);
                    scope.record(record.with_observation(note.clone())).await;
                    state.notes.push(note);
                }
                Turn::Malformed(raw) => {
                    scope
                        .record(record.with_observation(format!("malformed planner reply: {}", raw)))
                        .await;
                }
                Turn::Act(Action::ToolCall { tool, args }) => {
                    let observation = match self.registry.call_tool(&tool, args).await {
                        Ok(out) => out,
                        Err(e) => {
                            tracing::warn!(tool = %tool, error = %e, "planner tool call failed");
                            format!("error occurred: {}", e)
                        }
                    };
                    scope.record(record.with_tool_call(true).with_observation(observation)).await;
                }
                Turn::Act(Action::AgentCall { agent, task }) => {
                    let observation = self.delegate(scope, state, &agent, &task).await;
                    scope.record(record.with_observation(observation)).await;
                }
                Turn::Act(Action::Complete { answer }) => {
                    scope
                        .record(
                            record
                                .with_observation("final answer proposed")
                                .with_status(IterationStatus::Completed),
                        )
                        .await;
                    state.best = Some(answer.clone());
                    if let Some(end) = self.review(scope, state, answer).await {
                        return end;
                    }
                }
                Turn::Act(Action::ExecutionPlan(specs)) => match self.execute_plan(scope, state, specs, record).await {
                    PlanFlow::Replan => {}
                    PlanFlow::Candidate(answer) => {
                        if let Some(end) = self.review(scope, state, answer).await {
                            return end;
                        }
                    }
                    PlanFlow::Abort(end) => return end,
                },
            }
        }
    }

    /// 规划用的历史：最近的迭代 + 已完成任务的输出
    async fn planner_history(&self, scope: &SessionScope, state: &RunState) -> String {
        let history = self.memory.get_complete_history(scope.session_id()).await;
        let skip = history.iterations.len().saturating_sub(PLANNER_HISTORY_LIMIT);
        let mut out: String = history
            .iterations
            .iter()
            .skip(skip)
            .map(|it| format!("{}\n", it.render()))
            .collect();
        if !state.completed.is_empty() {
            out.push_str("\nCompleted tasks:\n");
            for done in state.completed.values() {
                out.push_str(&format!(
                    "[task {} by {}] {} => {}\n",
                    done.task_id,
                    done.agent,
                    done.task,
                    crate::react::parser::truncate(&value_text(&done.result), 500)
                ));
            }
        }
        out
    }

    /// 规划模型直接点名某个 Agent：作为单任务执行
    async fn delegate(&self, scope: &SessionScope, state: &mut RunState, agent: &str, task: &str) -> String {
        let id = self.registry.next_task_id(scope.session_id());
        let task = Task::from(TaskSpec::new(id, task, agent, &[]));
        match self.registry.execute(scope, &task, &[]).await {
            crate::workflow::TaskOutcome::Completed(result) => {
                let text = value_text(&result);
                state.completed.insert(
                    id,
                    DependencyOutput {
                        task_id: id,
                        agent: task.agent.clone(),
                        task: task.description.clone(),
                        result,
                    },
                );
                state.best = Some(text.clone());
                format!("task {} completed by {}: {}", id, agent, text)
            }
            crate::workflow::TaskOutcome::Failed { error } => format!("task {} failed: {}", id, error),
        }
    }

    async fn execute_plan(
        &self,
        scope: &SessionScope,
        state: &mut RunState,
        specs: Vec<TaskSpec>,
        record: Iteration,
    ) -> PlanFlow {
        self.registry
            .observe_task_ids(scope.session_id(), specs.iter().map(|s| s.task_id));
        let prior: HashSet<_> = state.completed.keys().copied().collect();
        let mut plan = match ExecutionPlan::build(specs, self.registry.as_ref(), &prior) {
            Ok(plan) => plan,
            Err(e) => return self.reject_plan(scope, state, record, e.into()).await,
        };
        let described = plan.describe();
        tracing::info!(tasks = plan.len(), synthesis = ?plan.synthesis_task(), "execution plan accepted");
        scope
            .record(record.with_observation(format!("execution plan accepted:\n{}", described)))
            .await;

        state.phases.advance(SessionPhase::FeedbackOnPlan);
        if let FeedbackResponse::Feedback(text) = self.feedback.request(&described, ORCHESTRATOR_NAME).await {
            self.record_feedback(scope, state, "execution plan", text).await;
            return PlanFlow::Replan;
        }

        state.phases.advance(SessionPhase::Executing);
        let report = match TaskScheduler::new(&self.registry, scope)
            .run(&mut plan, &mut state.completed)
            .await
        {
            Ok(report) => report,
            Err(e) => {
                let record = scope
                    .iteration(ORCHESTRATOR_NAME)
                    .with_thought("execution plan could not be scheduled")
                    .with_action("execute_plan", Value::Null);
                return self.reject_plan(scope, state, record, e).await;
            }
        };
        state.plan_failures = 0;
        tracing::info!(waves = report.waves.len(), "plan executed");

        match report.outcome {
            WaveOutcome::Synthesized { result, .. } | WaveOutcome::Finished { result, .. } => {
                let text = value_text(&result);
                state.best = Some(text.clone());
                PlanFlow::Candidate(text)
            }
            WaveOutcome::Stalled { failed, pending } => {
                if let Some(last) = plan
                    .ids_with_status(TaskStatus::Completed)
                    .last()
                    .and_then(|id| plan.get(*id))
                    .and_then(|t| t.result.as_ref())
                {
                    state.best = Some(value_text(last));
                }
                let failed_text: Vec<String> = failed.iter().map(|(id, e)| format!("task {} ({})", id, e)).collect();
                let note = format!(
                    "Plan stalled: {} failed; tasks {:?} could not run. Re-plan around the failure.",
                    failed_text.join(", "),
                    pending
                );
                scope
                    .record(
                        scope
                            .iteration(ORCHESTRATOR_NAME)
                            .with_thought("execution stalled on failed tasks")
                            .with_action("execute_plan", Value::Null)
                            .with_observation(note.clone()),
                    )
                    .await;
                state.notes.push(note);
                PlanFlow::Replan
            }
            WaveOutcome::BudgetExhausted { .. } => PlanFlow::Replan,
        }
    }

    /// 计划无效或有环：记录并计数，超过重试次数则中止会话
    async fn reject_plan(&self, scope: &SessionScope, state: &mut RunState, record: Iteration, err: HiveError) -> PlanFlow {
        state.plan_failures += 1;
        tracing::warn!(error = %err, attempt = state.plan_failures, "execution plan rejected");
        let note = format!("Previous execution plan was rejected: {}", err);
        scope.record(record.with_observation(note.clone())).await;
        state.notes.push(note);
        if state.plan_failures > self.config.max_plan_retries {
            return PlanFlow::Abort(End::Failed(HiveError::RetriesExhausted(state.plan_failures)));
        }
        PlanFlow::Replan
    }

    async fn record_feedback(&self, scope: &SessionScope, state: &mut RunState, subject: &str, text: String) {
        scope
            .record(
                scope
                    .iteration(ORCHESTRATOR_NAME)
                    .with_thought(format!("Human feedback on the {}, must re-plan", subject))
                    .with_action("human_feedback", Value::Null)
                    .with_observation(format!("feedback from the human user: {}", text)),
            )
            .await;
        state.notes.push(format!("User feedback on the {}: {}", subject, text));
    }

    /// 质量闸门 + 结果反馈；返回 Some 表示会话结束
    async fn review(&self, scope: &SessionScope, state: &mut RunState, answer: String) -> Option<End> {
        state.phases.advance(SessionPhase::QualityCheck);
        let evaluation = match self.critic.evaluate(scope.user_query(), &answer).await {
            Ok(e) => e,
            Err(e) => return Some(End::Failed(e)),
        };
        if !evaluation.is_adequate {
            let feedback = evaluation
                .feedback
                .unwrap_or_else(|| "the response does not fully answer the query".to_string());
            scope
                .record(
                    scope
                        .iteration(ORCHESTRATOR_NAME)
                        .with_thought("Quality check failed, the answer must be improved")
                        .with_action("quality_check", Value::String(answer))
                        .with_observation(format!("response inadequate: {}", feedback)),
                )
                .await;
            state
                .notes
                .push(format!("The previous answer was judged inadequate: {}", feedback));
            return None;
        }

        state.phases.advance(SessionPhase::FeedbackOnResult);
        match self.feedback.request(&answer, ORCHESTRATOR_NAME).await {
            FeedbackResponse::Feedback(text) => {
                self.record_feedback(scope, state, "final answer", text).await;
                None
            }
            FeedbackResponse::Continue => {
                state.phases.advance(SessionPhase::Completed);
                Some(End::Completed(answer))
            }
        }
    }
}
