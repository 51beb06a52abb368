//! Agent 注册表
//!
//! 按名字保存 Agent 实现；工具授权委托给 ToolRegistry。execute 是失败边界：
//! Agent 返回的错误和 panic 都在这里变成 TaskOutcome::Failed，同一波次的其他任务不受影响。
//! 任务 id 计数按会话隔离，单调递增。

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::agents::{Agent, AgentCx, DependencyOutput, SYNTHESIS_CAPABILITY};
use crate::core::{HiveError, SessionScope};
use crate::tools::{Tool, ToolExecutor};
use crate::workflow::{AgentCatalog, Task, TaskId, TaskOutcome};

/// 供规划提示词使用的 Agent 快照
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub capabilities: Vec<String>,
    pub tools: Vec<String>,
}

pub struct AgentRegistry {
    agents: RwLock<BTreeMap<String, Arc<dyn Agent>>>,
    tools: Arc<ToolExecutor>,
    task_ids: Mutex<HashMap<String, TaskId>>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl AgentRegistry {
    pub fn new(tools: Arc<ToolExecutor>) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            tools,
            task_ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn tool_executor(&self) -> &Arc<ToolExecutor> {
        &self.tools
    }

    /// 按名字注册（覆盖同名 Agent），并把随附工具授权给它；返回被拒绝的重复工具名
    pub fn register(&self, agent: Arc<dyn Agent>, tools: Vec<Arc<dyn Tool>>) -> Vec<String> {
        let name = agent.name().to_string();
        if let Ok(mut agents) = self.agents.write() {
            if agents.insert(name.clone(), agent).is_some() {
                tracing::debug!(agent = %name, "agent replaced");
            }
        }
        let mut rejected = Vec::new();
        for tool in tools {
            let tool_name = tool.name().to_string();
            if let Err(e) = self.add_tool_to_agent(&name, tool) {
                tracing::warn!(agent = %name, tool = %tool_name, error = %e, "tool rejected");
                rejected.push(tool_name);
            }
        }
        tracing::info!(agent = %name, "agent registered");
        rejected
    }

    pub fn get_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.read().ok().and_then(|a| a.get(name).cloned())
    }

    pub fn has_agent(&self, name: &str) -> bool {
        self.get_agent(name).is_some()
    }

    /// 所有 Agent 的快照（含当前工具）
    pub fn agents(&self) -> Vec<AgentInfo> {
        let agents: Vec<Arc<dyn Agent>> = self
            .agents
            .read()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default();
        agents
            .iter()
            .map(|a| AgentInfo {
                name: a.name().to_string(),
                description: a.description().to_string(),
                capabilities: a.capabilities(),
                tools: self.get_tools(a.name()).iter().map(|t| t.name().to_string()).collect(),
            })
            .collect()
    }

    /// 规划提示词里的「可用 Agent」列表
    pub fn describe_agents(&self) -> String {
        self.agents()
            .iter()
            .map(|a| {
                let mut line = format!("- {}: {}", a.name, a.description);
                if !a.capabilities.is_empty() {
                    line.push_str(&format!(" [capabilities: {}]", a.capabilities.join(", ")));
                }
                if !a.tools.is_empty() {
                    line.push_str(&format!(" [tools: {}]", a.tools.join(", ")));
                }
                line.push('\n');
                line
            })
            .collect()
    }

    /// Agent 工具快照
    pub fn get_tools(&self, agent_name: &str) -> Vec<Arc<dyn Tool>> {
        self.tools.registry().tools_for(agent_name)
    }

    /// 给已注册的 Agent 增加工具
    ///
    /// 同名工具已授权给该 Agent，或工具表里已有同名的另一个实例时报 DuplicateTool；
    /// 多个 Agent 共享同一个 Arc 实例是允许的。
    pub fn add_tool_to_agent(&self, agent_name: &str, tool: Arc<dyn Tool>) -> Result<(), HiveError> {
        if !self.has_agent(agent_name) {
            return Err(HiveError::AgentNotFound(agent_name.to_string()));
        }
        let tool_name = tool.name().to_string();
        let registry = self.tools.registry();
        if !registry.register(tool.clone())? {
            let same = registry
                .get(&tool_name)
                .map(|existing| Arc::ptr_eq(&existing, &tool))
                .unwrap_or(false);
            if !same {
                return Err(HiveError::DuplicateTool {
                    agent: agent_name.to_string(),
                    tool: tool_name,
                });
            }
            tracing::debug!(tool = %tool_name, "tool already registered, sharing existing instance");
        }
        registry.grant(agent_name, &tool_name)
    }

    pub fn remove_tool_from_agent(&self, agent_name: &str, tool_name: &str) -> bool {
        self.tools.registry().revoke(agent_name, tool_name)
    }

    /// 清空 Agent、工具与任务计数
    pub fn clear(&self) {
        if let Ok(mut agents) = self.agents.write() {
            agents.clear();
        }
        self.tools.registry().clear();
        if let Ok(mut ids) = self.task_ids.lock() {
            ids.clear();
        }
    }

    /// 执行任务；不会返回错误
    pub async fn execute(
        &self,
        session: &SessionScope,
        task: &Task,
        dependencies: &[DependencyOutput],
    ) -> TaskOutcome {
        let Some(agent) = self.get_agent(&task.agent) else {
            let err = HiveError::AgentNotFound(task.agent.clone());
            tracing::warn!(task_id = task.id, error = %err, "task failed");
            return TaskOutcome::Failed { error: err.to_string() };
        };

        let cx = AgentCx { session, registry: self };
        let run = AssertUnwindSafe(agent.execute(&cx, task, dependencies)).catch_unwind();
        match run.await {
            Ok(Ok(value)) => TaskOutcome::Completed(value),
            Ok(Err(e)) => {
                tracing::warn!(task_id = task.id, agent = %task.agent, error = %e, "task failed");
                TaskOutcome::Failed { error: e.to_string() }
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                tracing::error!(task_id = task.id, agent = %task.agent, panic = %msg, "agent panicked");
                TaskOutcome::Failed {
                    error: format!("agent '{}' panicked: {}", task.agent, msg),
                }
            }
        }
    }

    /// 以 Agent 身份调用工具（只能用授权给它的工具）
    pub async fn call_tool_as(&self, agent_name: &str, tool_name: &str, args: Value) -> Result<String, HiveError> {
        self.tools.call_as(agent_name, tool_name, args).await
    }

    /// 直接调用任意已注册工具
    pub async fn call_tool(&self, tool_name: &str, args: Value) -> Result<String, HiveError> {
        self.tools.call_tool(tool_name, args).await
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.registry().get(tool_name).is_some()
    }

    /// 会话内下一个任务 id（从 1 开始）
    pub fn next_task_id(&self, session_id: &str) -> TaskId {
        match self.task_ids.lock() {
            Ok(mut ids) => {
                let counter = ids.entry(session_id.to_string()).or_insert(0);
                *counter += 1;
                *counter
            }
            Err(poisoned) => {
                let mut ids = poisoned.into_inner();
                let counter = ids.entry(session_id.to_string()).or_insert(0);
                *counter += 1;
                *counter
            }
        }
    }

    /// 计划里出现的 id 推进计数器，之后分配的 id 不会与之冲突
    pub fn observe_task_ids(&self, session_id: &str, seen: impl IntoIterator<Item = TaskId>) {
        if let Ok(mut ids) = self.task_ids.lock() {
            let counter = ids.entry(session_id.to_string()).or_insert(0);
            for id in seen {
                *counter = (*counter).max(id);
            }
        }
    }

    /// 会话结束时释放计数器
    pub fn end_session(&self, session_id: &str) {
        if let Ok(mut ids) = self.task_ids.lock() {
            ids.remove(session_id);
        }
    }
}

impl AgentCatalog for AgentRegistry {
    fn has_agent(&self, name: &str) -> bool {
        AgentRegistry::has_agent(self, name)
    }

    fn is_synthesis(&self, name: &str) -> bool {
        self.get_agent(name)
            .map(|a| a.capabilities().iter().any(|c| c == SYNTHESIS_CAPABILITY))
            .unwrap_or(false)
    }
}
