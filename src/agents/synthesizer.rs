//! 综合 Agent：把依赖任务的输出合并为最终回答
//!
//! 每次执行只调用一次模型、只记一条迭代。回复里没有 final_response 时退回原文。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::{dependency_ids, render_dependencies, Agent, AgentCx, DependencyOutput, SYNTHESIS_CAPABILITY};
use crate::core::HiveError;
use crate::llm::LlmClient;
use crate::memory::IterationStatus;
use crate::react::parser::{decode, SynthesisReply};
use crate::react::prompts;
use crate::workflow::Task;

pub const SYNTHESIZER_NAME: &str = "ResponseSynthesizer";

pub struct ResponseSynthesizer {
    oracle: Arc<dyn LlmClient>,
}

impl ResponseSynthesizer {
    pub fn new(oracle: Arc<dyn LlmClient>) -> Self {
        Self { oracle }
    }
}

#[async_trait]
impl Agent for ResponseSynthesizer {
    fn name(&self) -> &str {
        SYNTHESIZER_NAME
    }

    fn description(&self) -> &str {
        "Combines the outputs of the other agents into the final answer for the user."
    }

    fn capabilities(&self) -> Vec<String> {
        vec![SYNTHESIS_CAPABILITY.to_string()]
    }

    async fn execute(
        &self,
        cx: &AgentCx<'_>,
        task: &Task,
        dependencies: &[DependencyOutput],
    ) -> Result<Value, HiveError> {
        let session = cx.session;
        let context = session
            .context_for(SYNTHESIZER_NAME, &task.description, &dependency_ids(dependencies))
            .await;
        let content = prompts::agent_content(
            &format!("{}\nUSER QUERY: {}", task.description, session.user_query()),
            &render_dependencies(dependencies),
            &context.render(),
            "",
        );
        let reply = self.oracle.generate(&prompts::synthesizer_system(), &content).await?;
        let answer = match decode::<SynthesisReply>(&reply) {
            Ok(r) => r.final_response,
            Err(e) => {
                tracing::warn!(error = %e, "synthesis reply malformed, using raw text");
                reply.trim().to_string()
            }
        };
        if answer.is_empty() {
            return Err(HiveError::NoResult(SYNTHESIZER_NAME.to_string()));
        }

        session
            .record(
                session
                    .iteration(SYNTHESIZER_NAME)
                    .with_task(Some(task.id))
                    .with_thought("Synthesized the final response from prerequisite outputs")
                    .with_action("final_response", Value::Null)
                    .with_observation(answer.clone())
                    .with_status(IterationStatus::Completed),
            )
            .await;
        Ok(Value::String(answer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::core::{SessionLimits, SessionScope};
    use crate::llm::ScriptedLlmClient;
    use crate::memory::{InMemoryDurableLog, InMemoryRecentCache, MemoryManager, MemoryPolicy, NoopIndex};
    use crate::react::prompts::SYNTHESIZER_ROLE;
    use crate::tools::{ToolExecutor, ToolRegistry};
    use crate::workflow::{TaskOutcome, TaskSpec};
    use serde_json::json;

    #[tokio::test]
    async fn test_single_iteration_with_dependency_outputs() {
        let oracle = Arc::new(
            ScriptedLlmClient::new()
                .on(SYNTHESIZER_ROLE, "```json\n{\"final_response\": \"Cloudy, 12°C. RAG = retrieval + generation.\"}\n```"),
        );
        let registry = AgentRegistry::new(Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()), 5)));
        registry.register(Arc::new(ResponseSynthesizer::new(oracle.clone())), vec![]);
        let memory = Arc::new(MemoryManager::new(
            Arc::new(InMemoryRecentCache::new(10)),
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(NoopIndex),
            oracle.clone(),
            MemoryPolicy::default(),
        ));
        let scope = SessionScope::new("s1", "weather and RAG?", memory.clone(), SessionLimits::default());

        let deps = vec![DependencyOutput {
            task_id: 1,
            agent: "WeatherExpert".into(),
            task: "weather".into(),
            result: json!("Cloudy, 12°C"),
        }];
        let task = Task::from(TaskSpec::new(2, "answer the user", SYNTHESIZER_NAME, &[1]));
        let outcome = registry.execute(&scope, &task, &deps).await;
        assert_eq!(
            outcome,
            TaskOutcome::Completed(json!("Cloudy, 12°C. RAG = retrieval + generation."))
        );
        assert_eq!(scope.total_iterations(), 1);

        let calls = oracle.calls();
        let synth_call = calls.iter().find(|(sys, _)| sys.contains(SYNTHESIZER_ROLE)).unwrap();
        assert!(synth_call.1.contains("Cloudy, 12°C"));
        assert!(synth_call.1.contains("weather and RAG?"));
    }
}
