//! 认知层：模型回复解码、提示词、Planner（每轮决策）、Critic（质量闸门）

pub mod critic;
pub mod parser;
pub mod planner;
pub mod prompts;

pub use critic::{Critic, Evaluation};
pub use parser::{decode, decode_reply, decode_step, Action, OracleReply, StepReply};
pub use planner::{classify, PlanRequest, Planner, PlannerTurn, Turn};
