//! LLM 层：推理模型抽象与实现（OpenAI 兼容 / Scripted）、重试包装、嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, RetryConfig, RetryingLlmClient};
