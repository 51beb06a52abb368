//! Scripted 客户端（用于测试与离线演示，无需 API）
//!
//! 按 system instruction 中包含的关键字匹配一组预置回复；同一关键字的回复按顺序消费，
//! 最后一条会被反复返回。也可以预置错误，用于验证降级与重试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

#[derive(Debug, Clone)]
enum ScriptedReply {
    Text(String),
    Fail(LlmError),
}

#[derive(Debug)]
struct Rule {
    needle: String,
    replies: VecDeque<ScriptedReply>,
}

/// 一次调用记录：(system_instruction, content)
pub type RecordedCall = (String, String);

/// Scripted 客户端：needle 匹配 system instruction，按注册顺序取第一条命中的规则
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
    count: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条文本回复
    pub fn on(self, needle: &str, reply: impl Into<String>) -> Self {
        self.push(needle, ScriptedReply::Text(reply.into()));
        self
    }

    /// 追加一条错误回复
    pub fn on_error(self, needle: &str, err: LlmError) -> Self {
        self.push(needle, ScriptedReply::Fail(err));
        self
    }

    fn push(&self, needle: &str, reply: ScriptedReply) {
        let mut rules = match self.rules.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(rule) = rules.iter_mut().find(|r| r.needle == needle) {
            rule.replies.push_back(reply);
        } else {
            rules.push(Rule {
                needle: needle.to_string(),
                replies: VecDeque::from([reply]),
            });
        }
    }

    pub fn call_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// 所有 system instruction 包含 needle 的调用次数
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|(sys, _)| sys.contains(needle)).count())
            .unwrap_or(0)
    }

    /// 调用记录快照
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn generate(&self, system_instruction: &str, content: &str) -> Result<String, LlmError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((system_instruction.to_string(), content.to_string()));
        }

        let reply = {
            let mut rules = self
                .rules
                .lock()
                .map_err(|_| LlmError::Api("scripted rules poisoned".to_string()))?;
            let rule = rules
                .iter_mut()
                .find(|r| system_instruction.contains(&r.needle))
                .ok_or_else(|| LlmError::Api("no scripted reply".to_string()))?;
            if rule.replies.len() > 1 {
                rule.replies.pop_front()
            } else {
                rule.replies.front().cloned()
            }
        };

        match reply {
            Some(ScriptedReply::Text(t)) => Ok(t),
            Some(ScriptedReply::Fail(e)) => Err(e),
            None => Err(LlmError::Empty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_in_order_last_sticky() {
        let client = ScriptedLlmClient::new().on("planner", "a").on("planner", "b");
        assert_eq!(client.generate("you are the planner", "").await.unwrap(), "a");
        assert_eq!(client.generate("you are the planner", "").await.unwrap(), "b");
        assert_eq!(client.generate("you are the planner", "").await.unwrap(), "b");
        assert_eq!(client.calls_matching("planner"), 3);
    }

    #[tokio::test]
    async fn test_unmatched_instruction_is_api_error() {
        let client = ScriptedLlmClient::new().on("planner", "a");
        let err = client.generate("evaluator", "").await.unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
    }
}
