//! 分层记忆：短期缓存（最近迭代）、持久日志（迭代 + 摘要）、语义检索，由 MemoryManager 组合

pub mod durable;
pub mod manager;
pub mod recent;
pub mod semantic;
pub mod tokenizer;
pub mod types;

pub use durable::{DurableLog, InMemoryDurableLog, SqliteDurableLog};
pub use manager::{ContextRequest, MemoryManager, MemoryPolicy};
pub use recent::{InMemoryRecentCache, RecentCache, SessionMeta};
pub use semantic::{EmbeddingIndex, KeywordIndex, NoopIndex, SemanticIndex};
pub use types::{
    ContextIntent, ConversationHistory, Iteration, IterationStatus, MemoryError, SessionStatus,
    Summary, SummaryScope, TaskContext,
};
