//! 回复格式 JSON Schema 生成（schemars）
//!
//! 把「合法回复」的结构注入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 返回 T 的 JSON Schema 字符串
pub fn reply_schema<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::parser::{EvaluationReply, StepReply};

    #[test]
    fn test_step_schema_lists_fields() {
        let schema = reply_schema::<StepReply>();
        for field in ["thought", "tool_call_requires", "action", "action_input", "status"] {
            assert!(schema.contains(field), "missing {}", field);
        }
    }

    #[test]
    fn test_evaluation_schema() {
        let schema = reply_schema::<EvaluationReply>();
        assert!(schema.contains("is_response_adequate"));
    }
}
