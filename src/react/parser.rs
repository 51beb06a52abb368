//! 模型输出解码
//!
//! 模型回复里应当有一个 ```json 围栏块。逐级降级：
//! 1. 严格解析
//! 2. 把字符串值里嵌套的 ``` 转义后重试（代码片段常见）
//! 3. 手工修补（尾逗号、未闭合的引号与括号）后重试
//! 4. 正则提取 "key": value 对
//!
//! 计划步骤（StepReply）永不失败：全部失败时返回 tool_call_requires=false、InProgress 的默认步骤，
//! 让循环继续而不是中止。

use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::HiveError;
use crate::memory::IterationStatus;
use crate::workflow::TaskSpec;

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json(.*)```").expect("valid regex"))
}

fn key_value_pairs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""([^"]+)"\s*:\s*("(?:\\.|[^"\\])*"|[^,}\s]+)"#).expect("valid regex")
    })
}

fn trailing_comma() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"))
}

/// 提取 JSON 块：优先 ```json 围栏（贪婪匹配到最后一个 ```，以容纳嵌套围栏），否则取首个 `{` 到末个 `}`
pub fn extract_json_block(text: &str) -> Option<String> {
    if let Some(cap) = fenced_json().captures(text) {
        return cap.get(1).map(|m| m.as_str().trim().to_string());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

/// 字符串值内的 ``` 转成 \u0060，裸换行转成 \n
fn escape_nested_fences(block: &str) -> String {
    let chars: Vec<char> = block.chars().collect();
    let mut out = String::with_capacity(block.len());
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' && (i == 0 || chars[i - 1] != '\\') {
            in_string = !in_string;
        }
        if in_string && chars[i..].starts_with(&['`', '`', '`']) {
            out.push_str("\\u0060\\u0060\\u0060");
            i += 3;
            continue;
        }
        if in_string && c == '\n' {
            out.push_str("\\n");
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

fn manual_clean(block: &str) -> String {
    let mut s = block.trim().to_string();
    if s.matches('"').count() % 2 == 1 {
        s.push('"');
    }
    if !s.starts_with('{') {
        s.insert(0, '{');
    }
    let open_brackets = s.matches('[').count().saturating_sub(s.matches(']').count());
    for _ in 0..open_brackets {
        s.push(']');
    }
    let open_braces = s.matches('{').count().saturating_sub(s.matches('}').count());
    for _ in 0..open_braces {
        s.push('}');
    }
    trailing_comma().replace_all(&s, "$1").to_string()
}

fn salvage_scalar(raw: &str) -> Value {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return Value::String(raw[1..raw.len() - 1].replace("\\\"", "\"").replace("\\n", "\n"));
    }
    match raw.to_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(raw.to_string())),
    }
}

/// 最后手段：正则提取顶层可见的键值对（嵌套结构会丢失）
pub fn salvage_fields(block: &str) -> Map<String, Value> {
    key_value_pairs()
        .captures_iter(block)
        .filter_map(|cap| {
            let key = cap.get(1)?.as_str().to_string();
            let value = salvage_scalar(cap.get(2)?.as_str());
            Some((key, value))
        })
        .collect()
}

/// 逐级解码为 JSON 值
pub fn decode_value(text: &str) -> Result<Value, HiveError> {
    let block = extract_json_block(text)
        .ok_or_else(|| HiveError::OracleMalformedResponse("no JSON block in response".to_string()))?;

    if let Ok(v) = serde_json::from_str::<Value>(&block) {
        return Ok(v);
    }
    if let Ok(v) = serde_json::from_str::<Value>(&escape_nested_fences(&block)) {
        tracing::debug!("decoded oracle reply after escaping nested fences");
        return Ok(v);
    }
    if let Ok(v) = serde_json::from_str::<Value>(&manual_clean(&escape_nested_fences(&block))) {
        tracing::debug!("decoded oracle reply after manual cleanup");
        return Ok(v);
    }

    let salvaged = salvage_fields(&block);
    if salvaged.is_empty() {
        return Err(HiveError::OracleMalformedResponse(format!(
            "unparseable JSON block: {}",
            truncate(&block, 200)
        )));
    }
    tracing::warn!(fields = salvaged.len(), "oracle reply salvaged from partial JSON");
    Ok(Value::Object(salvaged))
}

/// 解码为指定结构；字段缺失或类型不符时为 OracleMalformedResponse
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, HiveError> {
    let value = decode_value(text)?;
    serde_json::from_value(value).map_err(|e| HiveError::OracleMalformedResponse(e.to_string()))
}

pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(max_chars).collect();
        t.push_str("...");
        t
    }
}

// ---------------------------------------------------------------------------
// 回复格式
// ---------------------------------------------------------------------------

/// 单步思考-行动
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepReply {
    /// 当前推理
    pub thought: String,
    /// 是否需要调用工具
    pub tool_call_requires: bool,
    /// 工具名 / Agent 名 / execution_plan / final_answer，可为空
    pub action: String,
    /// 行动参数
    pub action_input: Value,
    /// InProgress 或 Completed
    #[schemars(with = "String")]
    pub status: IterationStatus,
}

impl Default for StepReply {
    fn default() -> Self {
        Self {
            thought: String::new(),
            tool_call_requires: false,
            action: String::new(),
            action_input: Value::Null,
            status: IterationStatus::InProgress,
        }
    }
}

fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl StepReply {
    /// 宽松读取：缺失字段取默认值
    pub fn from_value(value: &Value) -> Self {
        let field = |k: &str| value.get(k).cloned().unwrap_or(Value::Null);
        let action_input = match field("action_input") {
            // 有些模型把 action_input 写成 JSON 字符串
            Value::String(s) => serde_json::from_str::<Value>(&s)
                .ok()
                .filter(|v| v.is_object() || v.is_array())
                .unwrap_or(Value::String(s)),
            other => other,
        };
        Self {
            thought: as_text(&field("thought")),
            tool_call_requires: as_bool(&field("tool_call_requires")),
            action: as_text(&field("action")).trim().to_string(),
            action_input,
            status: IterationStatus::parse_lenient(&as_text(&field("status"))),
        }
    }
}

/// 解码单步；全部降级失败时返回默认步骤（原文作为 thought）
pub fn decode_step(text: &str) -> StepReply {
    match decode_value(text) {
        Ok(value) => StepReply::from_value(&value),
        Err(e) => {
            tracing::warn!(error = %e, "malformed step reply, using defaulted step");
            StepReply {
                thought: truncate(text.trim(), 500),
                ..StepReply::default()
            }
        }
    }
}

/// 执行计划回复
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanReply {
    pub execution_plan: Vec<TaskSpec>,
}

/// 任务分解回复
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DecompositionReply {
    #[serde(default)]
    pub thought: String,
    pub decomposed_tasks: Vec<String>,
    #[serde(default)]
    pub status: String,
}

/// 综合回复
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SynthesisReply {
    pub final_response: String,
}

/// 质量评估回复
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationReply {
    pub is_response_adequate: bool,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// 按字段形状区分的模型回复
#[derive(Debug, Clone)]
pub enum OracleReply {
    Plan(Vec<TaskSpec>),
    Decomposition(DecompositionReply),
    Synthesis(String),
    Evaluation(EvaluationReply),
    Step(StepReply),
}

fn shaped<T: DeserializeOwned>(value: Value) -> Result<T, HiveError> {
    serde_json::from_value(value).map_err(|e| HiveError::OracleMalformedResponse(e.to_string()))
}

pub fn decode_reply(text: &str) -> Result<OracleReply, HiveError> {
    let value = decode_value(text)?;
    if !value.is_object() {
        return Err(HiveError::OracleMalformedResponse(
            "reply is not a JSON object".to_string(),
        ));
    }
    if value.get("execution_plan").is_some() {
        return Ok(OracleReply::Plan(shaped::<PlanReply>(value)?.execution_plan));
    }
    if value.get("decomposed_tasks").is_some() {
        return Ok(OracleReply::Decomposition(shaped(value)?));
    }
    if value.get("final_response").is_some() {
        return Ok(OracleReply::Synthesis(shaped::<SynthesisReply>(value)?.final_response));
    }
    if value.get("is_response_adequate").is_some() {
        return Ok(OracleReply::Evaluation(shaped(value)?));
    }
    Ok(OracleReply::Step(StepReply::from_value(&value)))
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// 编排步骤的行动（封闭集合）；未知名字是 UnknownAction 错误而不是静默跳过
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ToolCall { tool: String, args: Value },
    AgentCall { agent: String, task: String },
    ExecutionPlan(Vec<TaskSpec>),
    Complete { answer: String },
}

const PLAN_ACTIONS: &[&str] = &["execution_plan", "plan"];
const COMPLETE_ACTIONS: &[&str] = &["final_answer", "complete", "finish", "respond"];

impl Action {
    /// 将步骤解析为行动；返回 None 表示只有思考、没有行动
    pub fn resolve(
        step: &StepReply,
        is_agent: impl Fn(&str) -> bool,
        is_tool: impl Fn(&str) -> bool,
    ) -> Result<Option<Action>, HiveError> {
        let name = step.action.as_str();
        let lowered = name.to_lowercase();

        if name.is_empty() || lowered == "none" {
            return Ok((step.status == IterationStatus::Completed).then(|| Action::Complete {
                answer: answer_text(&step.action_input, &step.thought),
            }));
        }
        if PLAN_ACTIONS.contains(&lowered.as_str()) {
            let plan_value = match &step.action_input {
                Value::Object(map) => map.get("execution_plan").cloned().unwrap_or(Value::Null),
                other => other.clone(),
            };
            let specs: Vec<TaskSpec> = shaped(plan_value)?;
            return Ok(Some(Action::ExecutionPlan(specs)));
        }
        if COMPLETE_ACTIONS.contains(&lowered.as_str()) {
            return Ok(Some(Action::Complete {
                answer: answer_text(&step.action_input, &step.thought),
            }));
        }
        if is_agent(name) {
            let task = match &step.action_input {
                Value::Object(map) => map
                    .get("task")
                    .or_else(|| map.get("query"))
                    .map(as_text)
                    .unwrap_or_else(|| step.action_input.to_string()),
                other => as_text(other),
            };
            return Ok(Some(Action::AgentCall {
                agent: name.to_string(),
                task,
            }));
        }
        if is_tool(name) {
            let args = match &step.action_input {
                Value::Object(_) => step.action_input.clone(),
                _ => Value::Object(Map::new()),
            };
            return Ok(Some(Action::ToolCall {
                tool: name.to_string(),
                args,
            }));
        }
        Err(HiveError::UnknownAction(name.to_string()))
    }
}

/// 从 action_input 中取最终回答；为空时退回 thought
pub fn answer_text(input: &Value, thought: &str) -> String {
    let text = match input {
        Value::Object(map) => map
            .get("answer")
            .or_else(|| map.get("response"))
            .or_else(|| map.get("final_response"))
            .map(as_text)
            .unwrap_or_default(),
        other => as_text(other),
    };
    if text.trim().is_empty() {
        thought.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_fenced_block() {
        let text = "Sure.\n```json\n{\"final_response\": \"42\"}\n```\nbye";
        assert!(matches!(decode_reply(text).unwrap(), OracleReply::Synthesis(ref s) if s == "42"));
    }

    #[test]
    fn test_bare_object_without_fence() {
        let v = decode_value("answer: {\"a\": 1} done").unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn test_nested_code_fence_in_string() {
        let text = "```json\n{\"thought\": \"run it\", \"action\": \"python\", \"action_input\": \"```python\nprint(1)\n```\", \"status\": \"InProgress\"}\n```";
        let step = decode_step(text);
        assert_eq!(step.action, "python");
        assert!(step.action_input.as_str().unwrap().contains("print(1)"));
    }

    #[test]
    fn test_manual_cleanup_trailing_comma_and_unclosed() {
        let text = "```json\n{\"is_response_adequate\": false, \"feedback\": \"add sources\",\n```";
        match decode_reply(text).unwrap() {
            OracleReply::Evaluation(e) => {
                assert!(!e.is_response_adequate);
                assert_eq!(e.feedback.as_deref(), Some("add sources"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_salvage_key_values() {
        let fields = salvage_fields(r#"{"thought": "x", "tool_call_requires": true, "n": 3, "action": get_forecast"#);
        assert_eq!(fields.get("thought"), Some(&json!("x")));
        assert_eq!(fields.get("tool_call_requires"), Some(&json!(true)));
        assert_eq!(fields.get("n"), Some(&json!(3)));
    }

    #[test]
    fn test_unparseable_step_defaults() {
        let step = decode_step("I could not decide.");
        assert!(!step.tool_call_requires);
        assert_eq!(step.status, IterationStatus::InProgress);
        assert!(step.action.is_empty());
        assert_eq!(step.thought, "I could not decide.");
    }

    #[test]
    fn test_no_block_is_malformed() {
        assert!(matches!(
            decode_value("plain text"),
            Err(HiveError::OracleMalformedResponse(_))
        ));
    }

    #[test]
    fn test_plan_reply() {
        let text = r#"```json
{"execution_plan": [
  {"task_id": 1, "task": "find weather", "agent": "WeatherExpert", "dependencies": []},
  {"task_id": 2, "task": "answer", "agent": "ResponseSynthesizer", "dependencies": [1]}
]}
```"#;
        match decode_reply(text).unwrap() {
            OracleReply::Plan(specs) => {
                assert_eq!(specs.len(), 2);
                assert_eq!(specs[1].dependencies, vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_action_resolution() {
        let is_agent = |n: &str| n == "WeatherExpert";
        let is_tool = |n: &str| n == "echo";

        let step = StepReply::from_value(&json!({"action": "echo", "action_input": {"text": "hi"}}));
        assert_eq!(
            Action::resolve(&step, is_agent, is_tool).unwrap(),
            Some(Action::ToolCall { tool: "echo".into(), args: json!({"text": "hi"}) })
        );

        let step = StepReply::from_value(&json!({"action": "WeatherExpert", "action_input": {"task": "Paris"}}));
        assert_eq!(
            Action::resolve(&step, is_agent, is_tool).unwrap(),
            Some(Action::AgentCall { agent: "WeatherExpert".into(), task: "Paris".into() })
        );

        let step = StepReply::from_value(&json!({"action": "launch_rocket"}));
        assert!(matches!(
            Action::resolve(&step, is_agent, is_tool),
            Err(HiveError::UnknownAction(ref n)) if n == "launch_rocket"
        ));

        let step = StepReply::from_value(&json!({"thought": "thinking", "action": ""}));
        assert_eq!(Action::resolve(&step, is_agent, is_tool).unwrap(), None);

        let step = StepReply::from_value(&json!({"thought": "done", "action": "final_answer", "action_input": {"answer": "ok"}}));
        assert_eq!(
            Action::resolve(&step, is_agent, is_tool).unwrap(),
            Some(Action::Complete { answer: "ok".into() })
        );
    }
}
