//! 推理模型（Oracle）抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted）实现 LlmClient：generate(system_instruction, content) -> 文本。
//! RetryingLlmClient 为任意后端包一层「超时 + 指数退避重试」，只重试瞬时错误。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out")]
    Timeout,

    #[error("API error: {0}")]
    Api(String),

    #[error("Empty response")]
    Empty,
}

impl LlmError {
    /// 瞬时错误（网络、限流、超时）值得重试；API 拒绝与空回复不重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::Network(_) | LlmError::RateLimited { .. } | LlmError::Timeout
        )
    }
}

/// 推理模型 trait：纯函数式 (instruction, content) -> text
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, system_instruction: &str, content: &str) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// [retry] 段：重试次数与退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）；限流时取服务端建议与退避的较大者
    pub fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = ((self.initial_backoff_ms as f64) * exp) as u64;
        let ms = ms.min(self.max_backoff_ms);
        let ms = match err {
            LlmError::RateLimited { retry_after_ms } => ms.max(*retry_after_ms).min(self.max_backoff_ms),
            _ => ms,
        };
        Duration::from_millis(ms)
    }
}

/// 带超时与重试的包装客户端
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
    request_timeout: Duration,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig, request_timeout_secs: u64) -> Self {
        Self {
            inner,
            config,
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn generate(&self, system_instruction: &str, content: &str) -> Result<String, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                self.request_timeout,
                self.inner.generate(system_instruction, content),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(LlmError::Timeout),
            };

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.backoff(attempt, &e);
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "oracle call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            multiplier: 2.0,
            max_backoff_ms: 5,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = RetryConfig::default();
        let e = LlmError::Timeout;
        assert_eq!(cfg.backoff(1, &e), Duration::from_millis(200));
        assert_eq!(cfg.backoff(2, &e), Duration::from_millis(400));
        assert_eq!(cfg.backoff(10, &e), Duration::from_millis(5000));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Network("reset".into()).is_transient());
        assert!(LlmError::RateLimited { retry_after_ms: 10 }.is_transient());
        assert!(!LlmError::Api("bad request".into()).is_transient());
        assert!(!LlmError::Empty.is_transient());
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let scripted = Arc::new(
            ScriptedLlmClient::new()
                .on_error("sys", LlmError::Network("reset".into()))
                .on("sys", "ok"),
        );
        let client = RetryingLlmClient::new(scripted.clone(), fast_retry(), 5);
        let out = client.generate("sys", "hello").await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(scripted.call_count(), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let scripted = Arc::new(
            ScriptedLlmClient::new().on_error("sys", LlmError::Network("down".into())),
        );
        let client = RetryingLlmClient::new(scripted.clone(), fast_retry(), 5);
        let err = client.generate("sys", "hello").await.unwrap_err();
        assert!(matches!(err, LlmError::Network(_)));
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test]
    async fn test_api_error_not_retried() {
        let scripted = Arc::new(
            ScriptedLlmClient::new().on_error("sys", LlmError::Api("invalid key".into())),
        );
        let client = RetryingLlmClient::new(scripted.clone(), fast_retry(), 5);
        assert!(client.generate("sys", "x").await.is_err());
        assert_eq!(scripted.call_count(), 1);
    }
}
