//! 记忆层数据模型
//!
//! Iteration 是唯一的审计与上下文来源：写入后不再修改。Summary 由 MemoryManager 的后台触发器生成，
//! 同一 (agent, task) 范围内的摘要区间首尾相接、互不重叠。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::workflow::TaskId;

/// 记忆层错误，按层区分，供降级策略判断
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Recent cache error: {0}")]
    Cache(String),

    #[error("Durable log error: {0}")]
    Durable(String),

    #[error("Semantic index error: {0}")]
    Index(String),
}

/// 迭代状态：Agent 自己声明是否已完成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IterationStatus {
    #[default]
    InProgress,
    Completed,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::InProgress => "InProgress",
            IterationStatus::Completed => "Completed",
        }
    }

    /// 宽松解析（模型输出的大小写不一）
    pub fn parse_lenient(s: &str) -> Self {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "completed" | "complete" | "done" => IterationStatus::Completed,
            _ => IterationStatus::InProgress,
        }
    }
}

/// 一次思考-行动记录（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub session_id: String,
    pub agent_name: String,
    pub task_id: Option<TaskId>,
    pub thought: String,
    pub action: String,
    pub action_input: Value,
    pub observation: String,
    pub tool_call_requires: bool,
    pub status: IterationStatus,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl Iteration {
    pub fn new(session_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            agent_name: agent_name.into(),
            task_id: None,
            thought: String::new(),
            action: String::new(),
            action_input: Value::Null,
            observation: String::new(),
            tool_call_requires: false,
            status: IterationStatus::InProgress,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_task(mut self, task_id: Option<TaskId>) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>, input: Value) -> Self {
        self.action = action.into();
        self.action_input = input;
        self
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = observation.into();
        self
    }

    pub fn with_tool_call(mut self, requires: bool) -> Self {
        self.tool_call_requires = requires;
        self
    }

    pub fn with_status(mut self, status: IterationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn scope(&self) -> SummaryScope {
        SummaryScope::of(&self.agent_name, self.task_id)
    }

    /// 写入语义索引的文本：thought + action + observation
    pub fn index_text(&self) -> String {
        format!(
            "thought: {}\naction: {}\nobservation: {}",
            self.thought, self.action, self.observation
        )
    }

    /// 用于提示词的单行表示
    pub fn render(&self) -> String {
        let task = self
            .task_id
            .map(|t| format!(" [task {}]", t))
            .unwrap_or_default();
        format!(
            "{}{}: thought={} | action={} {} | observation={}",
            self.agent_name,
            task,
            self.thought,
            self.action,
            self.action_input,
            self.observation
        )
    }
}

/// 会话整体状态：只允许 InProgress -> Completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionStatus {
    #[default]
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "InProgress",
            SessionStatus::Completed => "Completed",
        }
    }

    pub fn from_db(s: &str) -> Self {
        if s == "Completed" {
            SessionStatus::Completed
        } else {
            SessionStatus::InProgress
        }
    }
}

/// 会话历史（查询结果，不是存储结构）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub session_id: String,
    pub user_query: String,
    pub iterations: Vec<Iteration>,
    pub total_iterations: u64,
    pub final_status: SessionStatus,
}

impl ConversationHistory {
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

/// 摘要的归属范围：task_id 为空时按 Agent 计数，否则按任务计数
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SummaryScope {
    Agent(String),
    Task(TaskId),
}

impl SummaryScope {
    pub fn of(agent_name: &str, task_id: Option<TaskId>) -> Self {
        match task_id {
            Some(id) => SummaryScope::Task(id),
            None => SummaryScope::Agent(agent_name.to_string()),
        }
    }

    pub fn matches(&self, iteration: &Iteration) -> bool {
        match self {
            SummaryScope::Agent(name) => iteration.task_id.is_none() && &iteration.agent_name == name,
            SummaryScope::Task(id) => iteration.task_id == Some(*id),
        }
    }
}

/// 一段连续迭代区间 [start_idx, end_idx] 的摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub agent_name: String,
    pub task_id: Option<TaskId>,
    pub start_idx: u64,
    pub end_idx: u64,
    pub content: String,
    pub timestamp: i64,
}

/// 意图分类结果：本次任务需要哪些层的上下文（用完即弃）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextIntent {
    #[serde(default)]
    pub requires_summary: bool,
    #[serde(default)]
    pub requires_rag: bool,
    #[serde(default)]
    pub rag_query: Option<String>,
    #[serde(default)]
    pub confidence: f32,
}

impl ContextIntent {
    pub fn recent_only() -> Self {
        Self {
            requires_summary: false,
            requires_rag: false,
            rag_query: None,
            confidence: 0.0,
        }
    }
}

/// 交给 Agent 的任务上下文；summary / rag_results 为 None 表示未请求或该层不可用
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskContext {
    pub user_query: String,
    pub task: String,
    pub recent_history: Vec<Iteration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_results: Option<Vec<String>>,
}

impl TaskContext {
    /// 渲染为提示词片段
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.recent_history.is_empty() {
            out.push_str("## Recent history\n");
            for it in &self.recent_history {
                out.push_str(&it.render());
                out.push('\n');
            }
        }
        if let Some(summaries) = &self.summary {
            out.push_str("## Summaries of prior work\n");
            for s in summaries {
                out.push_str("- ");
                out.push_str(s);
                out.push('\n');
            }
        }
        if let Some(hits) = &self.rag_results {
            out.push_str("## Related records\n");
            for h in hits {
                out.push_str("- ");
                out.push_str(h);
                out.push('\n');
            }
        }
        out
    }
}
