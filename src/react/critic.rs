//! Critic：质量闸门
//!
//! 对 (用户查询, 综合结果) 调用一次评估模型，得到是否合格与改进意见。
//! 模型不可达时报 OracleUnavailable（会话中止）；回复无法解析时按合格处理并告警，
//! 避免一个格式错误的评估把已有的答案拖进无意义的重新规划。

use std::sync::Arc;

use crate::core::HiveError;
use crate::llm::LlmClient;
use crate::react::parser::{decode, EvaluationReply};
use crate::react::prompts;

/// 评估结果
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub is_adequate: bool,
    pub feedback: Option<String>,
}

pub struct Critic {
    llm: Arc<dyn LlmClient>,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn evaluate(&self, user_query: &str, response: &str) -> Result<Evaluation, HiveError> {
        let reply = self
            .llm
            .generate(
                &prompts::evaluator_system(),
                &prompts::evaluator_content(user_query, response),
            )
            .await?;

        let evaluation = match decode::<EvaluationReply>(&reply) {
            Ok(r) => Evaluation {
                is_adequate: r.is_response_adequate,
                feedback: r.feedback.filter(|f| !f.trim().is_empty()),
            },
            Err(e) => {
                tracing::warn!(error = %e, "evaluation reply malformed, accepting response");
                Evaluation {
                    is_adequate: true,
                    feedback: None,
                }
            }
        };
        tracing::info!(adequate = evaluation.is_adequate, feedback = ?evaluation.feedback, "quality check");
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::react::prompts::EVALUATOR_ROLE;

    #[tokio::test]
    async fn test_inadequate_with_feedback() {
        let llm = Arc::new(ScriptedLlmClient::new().on(
            EVALUATOR_ROLE,
            "```json\n{\"is_response_adequate\": false, \"feedback\": \"missing the weather\"}\n```",
        ));
        let eval = Critic::new(llm).evaluate("q", "r").await.unwrap();
        assert_eq!(
            eval,
            Evaluation {
                is_adequate: false,
                feedback: Some("missing the weather".into())
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_reply_accepts() {
        let llm = Arc::new(ScriptedLlmClient::new().on(EVALUATOR_ROLE, "looks fine to me"));
        let eval = Critic::new(llm).evaluate("q", "r").await.unwrap();
        assert!(eval.is_adequate);
    }

    #[tokio::test]
    async fn test_unreachable_oracle_is_fatal() {
        let llm = Arc::new(ScriptedLlmClient::new().on_error(EVALUATOR_ROLE, LlmError::Network("down".into())));
        assert!(matches!(
            Critic::new(llm).evaluate("q", "r").await,
            Err(HiveError::OracleUnavailable(_))
        ));
    }
}
