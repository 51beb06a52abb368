//! 各角色的 system instruction 与 content 模板
//!
//! 每个 system instruction 以固定的角色首行开头（*_ROLE），离线 Scripted 客户端按它匹配回复。

use crate::react::parser::{
    DecompositionReply, EvaluationReply, PlanReply, StepReply, SynthesisReply,
};
use crate::tools::schema::reply_schema;

pub const PLANNER_ROLE: &str = "You are the Orchestrator of a multi-agent system.";
pub const INTENT_ROLE: &str = "You are the context manager of a multi-agent system.";
pub const SUMMARIZER_ROLE: &str = "You summarize the work log of AI agents.";
pub const EVALUATOR_ROLE: &str = "You are the quality evaluator of a multi-agent system.";
pub const DECOMPOSER_ROLE: &str = "You are the task decomposition expert.";
pub const SYNTHESIZER_ROLE: &str = "You are the response synthesis expert.";

fn fenced(schema: String) -> String {
    format!("```json\n{}\n```", schema)
}

fn feedback_block(feedbacks: &[String]) -> String {
    if feedbacks.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n## Feedback previously given by the user\n");
    for f in feedbacks {
        out.push_str("- ");
        out.push_str(f);
        out.push('\n');
    }
    out
}

pub fn planner_system(available_agents: &str, feedbacks: &[String]) -> String {
    format!(
        "{role}\n\
         Analyse the user query and the history, then choose the next step.\n\
         \n\
         ## Available agents\n{agents}\n\
         ## Rules\n\
         - Break complex queries down with the decomposition agent, then reply with an execution plan.\n\
         - Every task names exactly one agent from the list above and lists the task ids it depends on.\n\
         - Dependencies may only reference tasks of the same plan or tasks already completed.\n\
         - Put exactly one synthesis agent task last; it depends on everything it must combine.\n\
         - If you can answer directly, use action \"final_answer\" with status \"Completed\".\n\
         {feedback}\n\
         ## Step reply format\n{step}\n\
         ## Execution plan reply format\n{plan}\n",
        role = PLANNER_ROLE,
        agents = available_agents,
        feedback = feedback_block(feedbacks),
        step = fenced(reply_schema::<StepReply>()),
        plan = fenced(reply_schema::<PlanReply>()),
    )
}

pub fn planner_content(user_query: &str, history: &str, notes: &[String]) -> String {
    let mut out = format!("USER QUERY: {}\n\n<HISTORY>\n{}</HISTORY>\n", user_query, history);
    if !notes.is_empty() {
        out.push_str("\n<NOTES>\n");
        for n in notes {
            out.push_str(n);
            out.push('\n');
        }
        out.push_str("</NOTES>\n");
    }
    out.push_str("\nGenerate your structured reply for the next step.");
    out
}

pub fn intent_system() -> String {
    format!(
        "{}\n\
         Decide which context the current task needs:\n\
         - recent history only (default)\n\
         - summaries of earlier work (requires_summary)\n\
         - semantic retrieval of older records (requires_rag, optional rag_query)\n\
         Reply with one JSON block: {{\"requires_summary\": bool, \"requires_rag\": bool, \
         \"rag_query\": string|null, \"confidence\": 0.0-1.0}}",
        INTENT_ROLE
    )
}

pub fn intent_content(
    user_query: &str,
    task: &str,
    agent_name: &str,
    summaries: &[String],
    recent: &str,
) -> String {
    let summaries = if summaries.is_empty() {
        "(none)".to_string()
    } else {
        summaries.join("\n")
    };
    format!(
        "USER QUERY: {}\n\nCURRENT TASK: {}\nAGENT: {}\n\nSUMMARIES OF DEPENDENCIES:\n{}\n\nRECENT HISTORY:\n{}\n",
        user_query, task, agent_name, summaries, recent
    )
}

pub fn summarizer_system() -> String {
    format!(
        "{}\n\
         Capture key points, decisions and facts discovered. \
         Reply with one JSON block: {{\"summary\": \"...\"}}",
        SUMMARIZER_ROLE
    )
}

pub fn summarizer_content(iterations: &str, previous: Option<&str>) -> String {
    match previous {
        Some(p) => format!("PREVIOUS SUMMARY:\n{}\n\nNEW ITERATIONS:\n{}", p, iterations),
        None => format!("ITERATIONS:\n{}", iterations),
    }
}

pub fn evaluator_system() -> String {
    format!(
        "{}\n\
         Judge whether the response fully and correctly answers the user query. \
         If not, explain what is missing in feedback.\n\
         Reply format:\n{}",
        EVALUATOR_ROLE,
        fenced(reply_schema::<EvaluationReply>())
    )
}

pub fn evaluator_content(user_query: &str, response: &str) -> String {
    format!("USER QUERY: {}\n\nRESPONSE:\n{}", user_query, response)
}

pub fn decomposer_system(feedbacks: &[String]) -> String {
    format!(
        "{}\n\
         Split the task into small, independent sub-tasks that one expert agent can each handle.\n\
         {}\n\
         Reply format:\n{}",
        DECOMPOSER_ROLE,
        feedback_block(feedbacks),
        fenced(reply_schema::<DecompositionReply>())
    )
}

pub fn synthesizer_system() -> String {
    format!(
        "{}\n\
         Combine the outputs of the other agents into one complete answer to the user query.\n\
         Reply format:\n{}",
        SYNTHESIZER_ROLE,
        fenced(reply_schema::<SynthesisReply>())
    )
}

pub fn tool_agent_system(name: &str, description: &str, tools: &str) -> String {
    format!(
        "You are {name}, an expert agent. {description}\n\
         Work step by step. Call at most one tool per step; set status to \"Completed\" and put \
         your final answer in action_input when you are done.\n\
         \n\
         ## Tools\n{tools}\n\
         ## Reply format\n{step}",
        name = name,
        description = description,
        tools = tools,
        step = fenced(reply_schema::<StepReply>()),
    )
}

/// Agent 任务 content：任务 + 依赖输出 + 记忆上下文 + 本轮已有步骤
pub fn agent_content(task: &str, dependencies: &str, context: &str, steps: &str) -> String {
    let mut out = format!("TASK: {}\n", task);
    if !dependencies.is_empty() {
        out.push_str("\n## Outputs of prerequisite tasks\n");
        out.push_str(dependencies);
        out.push('\n');
    }
    if !context.is_empty() {
        out.push('\n');
        out.push_str(context);
    }
    if !steps.is_empty() {
        out.push_str("\n## Your steps so far\n");
        out.push_str(steps);
    }
    out
}
