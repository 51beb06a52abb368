//! Planner：编排器每一轮的决策
//!
//! 调用规划模型，把回复解码为封闭的 Action 集合。直接给出 {execution_plan} 的回复视为计划；
//! 步骤回复按 action 名分派到工具 / Agent / 计划 / 完成。未知名字、无法解码的回复与只有思考的回复
//! 都作为 Turn 返回，由编排器记录后继续；只有模型不可达才返回错误。

use std::sync::Arc;

use serde_json::Value;

use crate::core::HiveError;
use crate::llm::LlmClient;
use crate::react::parser::{decode_reply, decode_step, truncate, Action, OracleReply, StepReply};
use crate::react::prompts;

/// 规划一轮的输入
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub user_query: &'a str,
    /// 可用 Agent 列表（提示词片段）
    pub agents: &'a str,
    /// 用户给编排器的历史反馈
    pub feedbacks: &'a [String],
    pub history: &'a str,
    /// 上一轮留下的说明（计划无效、质量不合格、人工反馈等）
    pub notes: &'a [String],
}

/// 规划结果
#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    Act(Action),
    /// 只有思考
    Think,
    /// 模型给出了未知的 action 名
    Unknown(String),
    /// 回复无法解码（原文截断保存）
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct PlannerTurn {
    pub thought: String,
    pub action_name: String,
    pub action_input: Value,
    pub turn: Turn,
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    pub async fn next_turn(
        &self,
        req: PlanRequest<'_>,
        is_agent: impl Fn(&str) -> bool,
        is_tool: impl Fn(&str) -> bool,
    ) -> Result<PlannerTurn, HiveError> {
        let reply = self
            .llm
            .generate(
                &prompts::planner_system(req.agents, req.feedbacks),
                &prompts::planner_content(req.user_query, req.history, req.notes),
            )
            .await?;
        Ok(classify(&reply, is_agent, is_tool))
    }
}

fn from_step(step: StepReply, turn: Turn) -> PlannerTurn {
    PlannerTurn {
        thought: step.thought,
        action_name: step.action,
        action_input: step.action_input,
        turn,
    }
}

/// 回复分类（纯函数，便于测试）
pub fn classify(reply: &str, is_agent: impl Fn(&str) -> bool, is_tool: impl Fn(&str) -> bool) -> PlannerTurn {
    match decode_reply(reply) {
        Ok(OracleReply::Plan(specs)) => PlannerTurn {
            thought: String::new(),
            action_name: "execution_plan".to_string(),
            action_input: serde_json::to_value(&specs).unwrap_or(Value::Null),
            turn: Turn::Act(Action::ExecutionPlan(specs)),
        },
        Ok(OracleReply::Synthesis(answer)) => PlannerTurn {
            thought: String::new(),
            action_name: "final_answer".to_string(),
            action_input: Value::String(answer.clone()),
            turn: Turn::Act(Action::Complete { answer }),
        },
        Ok(OracleReply::Step(step)) => match Action::resolve(&step, &is_agent, &is_tool) {
            Ok(Some(action)) => from_step(step, Turn::Act(action)),
            Ok(None) => from_step(step, Turn::Think),
            Err(HiveError::UnknownAction(name)) => from_step(step, Turn::Unknown(name)),
            Err(e) => {
                let msg = e.to_string();
                from_step(step, Turn::Malformed(msg))
            }
        },
        Ok(_) | Err(_) => {
            let step = decode_step(reply);
            let raw = truncate(reply.trim(), 300);
            tracing::warn!(reply = %raw, "planner reply not usable");
            from_step(step, Turn::Malformed(raw))
        }
    }
}
