//! 通用工具型专家 Agent
//!
//! 顺序执行思考-行动循环：每步让模型给出 StepReply，需要工具时以本 Agent 身份调用，
//! 观察写入迭代日志后进入下一步。工具失败（缺参数、未授权、超时、执行错误）不会中断循环，
//! 观察记为 "error occurred"。循环在模型回复 Completed、单 Agent 上限或全会话上限时结束。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::agents::{dependency_ids, render_dependencies, Agent, AgentCx, DependencyOutput};
use crate::core::HiveError;
use crate::llm::LlmClient;
use crate::memory::IterationStatus;
use crate::react::parser::{answer_text, decode_step, truncate};
use crate::react::prompts;
use crate::workflow::Task;

/// 工具失败时写入迭代日志的观察
pub const TOOL_ERROR_OBSERVATION: &str = "error occurred";

pub struct ToolAgent {
    name: String,
    description: String,
    capabilities: Vec<String>,
    oracle: Arc<dyn LlmClient>,
}

impl ToolAgent {
    pub fn new(name: impl Into<String>, description: impl Into<String>, oracle: Arc<dyn LlmClient>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capabilities: Vec::new(),
            oracle,
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.push(tag.into());
        self
    }
}

#[async_trait]
impl Agent for ToolAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn execute(
        &self,
        cx: &AgentCx<'_>,
        task: &Task,
        dependencies: &[DependencyOutput],
    ) -> Result<Value, HiveError> {
        let session = cx.session;
        let context = session
            .context_for(&self.name, &task.description, &dependency_ids(dependencies))
            .await;
        let tools = cx.registry.tool_executor().registry().to_schema_json(&self.name);
        let system = prompts::tool_agent_system(&self.name, &self.description, &tools);
        let deps_text = render_dependencies(dependencies);
        let context_text = context.render();

        let mut steps: Vec<String> = Vec::new();
        let mut last_answer: Option<String> = None;
        let max_rounds = session.limits().max_agent_iterations.max(1);

        for round in 1..=max_rounds {
            if session.budget_exhausted() {
                tracing::info!(agent = %self.name, task_id = task.id, round, "session iteration cap reached");
                break;
            }
            let content = prompts::agent_content(&task.description, &deps_text, &context_text, &steps.join("\n"));
            let reply = self.oracle.generate(&system, &content).await?;
            let step = decode_step(&reply);

            let record = session
                .iteration(&self.name)
                .with_task(Some(task.id))
                .with_thought(step.thought.clone())
                .with_action(step.action.clone(), step.action_input.clone())
                .with_tool_call(step.tool_call_requires)
                .with_status(step.status);

            if step.tool_call_requires && !step.action.is_empty() && step.status != IterationStatus::Completed {
                let args = match &step.action_input {
                    Value::Object(_) => step.action_input.clone(),
                    _ => Value::Object(Map::new()),
                };
                let observation = match cx.registry.call_tool_as(&self.name, &step.action, args).await {
                    Ok(out) => out,
                    Err(e) if e.is_tool_failure() => {
                        tracing::warn!(agent = %self.name, tool = %step.action, error = %e, "tool call failed");
                        TOOL_ERROR_OBSERVATION.to_string()
                    }
                    Err(e) => return Err(e),
                };
                steps.push(format!(
                    "{}. thought: {} | tool: {} {} | observation: {}",
                    round,
                    step.thought,
                    step.action,
                    step.action_input,
                    truncate(&observation, 2000)
                ));
                session.record(record.with_observation(observation)).await;
                continue;
            }

            let answer = answer_text(&step.action_input, &step.thought);
            session.record(record.with_observation("not applicable")).await;
            if step.status == IterationStatus::Completed {
                return Ok(Value::String(answer));
            }
            steps.push(format!("{}. thought: {}", round, step.thought));
            if !answer.trim().is_empty() {
                last_answer = Some(answer);
            }
        }

        match last_answer {
            Some(answer) => {
                tracing::info!(agent = %self.name, task_id = task.id, "iteration cap reached, returning last answer");
                Ok(Value::String(answer))
            }
            None => Err(HiveError::NoResult(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentRegistry;
    use crate::core::{SessionLimits, SessionScope};
    use crate::llm::ScriptedLlmClient;
    use crate::memory::{InMemoryDurableLog, InMemoryRecentCache, MemoryManager, MemoryPolicy, NoopIndex};
    use crate::tools::{FnTool, ParamSpec, ToolExecutor, ToolRegistry};
    use crate::workflow::{TaskOutcome, TaskSpec};

    const ROLE: &str = "You are WeatherExpert, an expert agent.";

    fn forecast() -> Arc<FnTool> {
        Arc::new(FnTool::new(
            "get_forecast",
            "Weather forecast for a city",
            vec![ParamSpec::required("city", "string", "City name")],
            |a| Ok(format!("{}: 12°C", a["city"].as_str().unwrap_or("?"))),
        ))
    }

    fn setup(oracle: Arc<ScriptedLlmClient>, limits: SessionLimits) -> (AgentRegistry, SessionScope, Arc<MemoryManager>) {
        let registry = AgentRegistry::new(Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()), 5)));
        registry.register(
            Arc::new(ToolAgent::new("WeatherExpert", "Knows the weather.", oracle.clone())),
            vec![forecast()],
        );
        let memory = Arc::new(MemoryManager::new(
            Arc::new(InMemoryRecentCache::new(10)),
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(NoopIndex),
            oracle,
            MemoryPolicy::default(),
        ));
        let scope = SessionScope::new("s1", "weather in London?", memory.clone(), limits);
        (registry, scope, memory)
    }

    fn task() -> Task {
        Task::from(TaskSpec::new(1, "weather in London", "WeatherExpert", &[]))
    }

    #[tokio::test]
    async fn test_missing_parameter_recorded_as_error_observation() {
        let oracle = Arc::new(
            ScriptedLlmClient::new()
                .on(
                    ROLE,
                    r#"```json
{"thought": "look it up", "tool_call_requires": true, "action": "get_forecast", "action_input": {}, "status": "InProgress"}
```"#,
                )
                .on(
                    ROLE,
                    r#"```json
{"thought": "retry with city", "tool_call_requires": true, "action": "get_forecast", "action_input": {"city": "London"}, "status": "InProgress"}
```"#,
                )
                .on(
                    ROLE,
                    r#"```json
{"thought": "done", "tool_call_requires": false, "action": "final_answer", "action_input": {"answer": "London: 12°C"}, "status": "Completed"}
```"#,
                ),
        );
        let (registry, scope, memory) = setup(oracle, SessionLimits::default());
        memory.initialize_session("s1", "weather in London?").await.unwrap();

        let outcome = registry.execute(&scope, &task(), &[]).await;
        assert_eq!(outcome, TaskOutcome::Completed(Value::String("London: 12°C".into())));

        let history = memory.get_task_history("s1", &[1]).await;
        let observations: Vec<&str> = history.iterations.iter().map(|i| i.observation.as_str()).collect();
        assert_eq!(observations, vec![TOOL_ERROR_OBSERVATION, "London: 12°C", "not applicable"]);
    }

    #[tokio::test]
    async fn test_agent_cap_returns_last_answer() {
        let oracle = Arc::new(ScriptedLlmClient::new().on(
            ROLE,
            r#"```json
{"thought": "probably mild", "tool_call_requires": false, "action": "", "action_input": "mild", "status": "InProgress"}
```"#,
        ));
        let limits = SessionLimits {
            max_iterations: 30,
            max_agent_iterations: 2,
        };
        let (registry, scope, _memory) = setup(oracle.clone(), limits);
        let outcome = registry.execute(&scope, &task(), &[]).await;
        assert_eq!(outcome, TaskOutcome::Completed(Value::String("mild".into())));
        assert_eq!(oracle.calls_matching(ROLE), 2);
        assert_eq!(scope.total_iterations(), 2);
    }

    #[tokio::test]
    async fn test_session_cap_stops_before_calling_oracle() {
        let oracle = Arc::new(ScriptedLlmClient::new());
        let limits = SessionLimits {
            max_iterations: 0,
            max_agent_iterations: 5,
        };
        let (registry, scope, _memory) = setup(oracle.clone(), limits);
        assert!(matches!(
            registry.execute(&scope, &task(), &[]).await,
            TaskOutcome::Failed { .. }
        ));
        assert_eq!(oracle.call_count(), 0);
    }
}
