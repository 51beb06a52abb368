//! 任务分解 Agent
//!
//! 把复杂请求拆成若干子任务，用会话计数器给每个子任务分配 id，然后把分解结果交给人工确认。
//! 收到反馈时记一条迭代、带着全部历史反馈重新分解；确认后返回 [{task_id, task}]。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{render_dependencies, Agent, AgentCx, DependencyOutput, DECOMPOSITION_CAPABILITY};
use crate::core::HiveError;
use crate::feedback::{FeedbackGate, FeedbackResponse};
use crate::llm::LlmClient;
use crate::memory::IterationStatus;
use crate::react::parser::{decode, DecompositionReply};
use crate::react::prompts;
use crate::workflow::Task;

pub const DECOMPOSER_NAME: &str = "TaskDecomposer";

pub struct TaskDecomposer {
    oracle: Arc<dyn LlmClient>,
    feedback: Arc<FeedbackGate>,
}

impl TaskDecomposer {
    pub fn new(oracle: Arc<dyn LlmClient>, feedback: Arc<FeedbackGate>) -> Self {
        Self { oracle, feedback }
    }
}

fn proposal_text(tasks: &[Value]) -> String {
    let mut out = String::from("Proposed task decomposition:\n");
    for t in tasks {
        out.push_str(&format!(
            "{}. {}\n",
            t["task_id"],
            t["task"].as_str().unwrap_or_default()
        ));
    }
    out
}

#[async_trait]
impl Agent for TaskDecomposer {
    fn name(&self) -> &str {
        DECOMPOSER_NAME
    }

    fn description(&self) -> &str {
        "Breaks a complex request into small sub-tasks, each solvable by one expert agent."
    }

    fn capabilities(&self) -> Vec<String> {
        vec![DECOMPOSITION_CAPABILITY.to_string()]
    }

    async fn execute(
        &self,
        cx: &AgentCx<'_>,
        task: &Task,
        dependencies: &[DependencyOutput],
    ) -> Result<Value, HiveError> {
        let session = cx.session;
        let agents = cx.registry.describe_agents();
        let content = prompts::agent_content(
            &task.description,
            &render_dependencies(dependencies),
            &format!("## Available agents\n{}", agents),
            "",
        );
        let mut last: Option<Value> = None;

        for _ in 0..session.limits().max_agent_iterations.max(1) {
            if session.budget_exhausted() {
                break;
            }
            let system = prompts::decomposer_system(&self.feedback.feedbacks_for(DECOMPOSER_NAME));
            let reply = self.oracle.generate(&system, &content).await?;
            let record = session.iteration(DECOMPOSER_NAME).with_task(Some(task.id));

            let decomposition = match decode::<DecompositionReply>(&reply) {
                Ok(d) if !d.decomposed_tasks.is_empty() => d,
                Ok(_) | Err(_) => {
                    tracing::warn!(task_id = task.id, "decomposition reply unusable");
                    session
                        .record(record.with_thought("decomposition reply unusable").with_observation("error occurred"))
                        .await;
                    continue;
                }
            };

            let tasks: Vec<Value> = decomposition
                .decomposed_tasks
                .iter()
                .map(|t| json!({"task_id": cx.registry.next_task_id(session.session_id()), "task": t}))
                .collect();
            let tasks_value = Value::Array(tasks.clone());

            match self.feedback.request(&proposal_text(&tasks), DECOMPOSER_NAME).await {
                FeedbackResponse::Feedback(text) => {
                    session
                        .record(
                            record
                                .with_thought("Human feedback received, decomposition must be improved")
                                .with_action("decompose", tasks_value.clone())
                                .with_observation(format!("feedback from the human user: {}", text)),
                        )
                        .await;
                    last = Some(tasks_value);
                }
                FeedbackResponse::Continue => {
                    session
                        .record(
                            record
                                .with_thought(decomposition.thought)
                                .with_action("decompose", Value::Null)
                                .with_observation(tasks_value.to_string())
                                .with_status(IterationStatus::Completed),
                        )
                        .await;
                    return Ok(tasks_value);
                }
            }
        }

        last.ok_or_else(|| HiveError::NoResult(DECOMPOSER_NAME.to_string()))
    }
}
