//! 语义检索层：upsert(id, text, metadata) + search(query, top_k)
//!
//! - KeywordIndex：分词后按词重叠打分，Jaccard 作为平分时的次序
//! - EmbeddingIndex：调用嵌入 API，余弦相似度排序
//! - NoopIndex：未启用检索
//!
//! 每个索引实例带命名空间，条目 id 以 `namespace:` 为前缀，多部署共享后端时互不可见。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::llm::EmbeddingProvider;
use crate::memory::tokenizer::{jaccard_similarity, overlap_score, tokenize_to_set};
use crate::memory::types::MemoryError;

#[async_trait]
pub trait SemanticIndex: Send + Sync {
    fn namespace(&self) -> &str;

    /// 相同 id 覆盖旧条目
    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), MemoryError>;

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>, MemoryError>;

    /// Noop 实现返回 false
    fn enabled(&self) -> bool {
        true
    }
}

fn index_lock<T>(_: T) -> MemoryError {
    MemoryError::Index("semantic index lock poisoned".to_string())
}

fn namespaced(ns: &str, id: &str) -> String {
    format!("{}:{}", ns, id)
}

/// 插入或替换；超过 max_entries 时淘汰最早的条目
fn upsert_bounded<E>(entries: &mut Vec<(String, E)>, key: String, entry: E, max_entries: usize) {
    if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
        slot.1 = entry;
        return;
    }
    entries.push((key, entry));
    let n = entries.len();
    if n > max_entries {
        entries.drain(0..n - max_entries);
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndex;

#[async_trait]
impl SemanticIndex for NoopIndex {
    fn namespace(&self) -> &str {
        ""
    }

    async fn upsert(&self, _: &str, _: &str, _: HashMap<String, String>) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn search(&self, _: &str, _: usize) -> Result<Vec<String>, MemoryError> {
        Ok(Vec::new())
    }

    fn enabled(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KeywordEntry {
    text: String,
    tokens: HashSet<String>,
}

/// 关键词重叠索引（无需外部服务）
#[derive(Debug)]
pub struct KeywordIndex {
    namespace: String,
    max_entries: usize,
    entries: RwLock<Vec<(String, KeywordEntry)>>,
}

impl KeywordIndex {
    pub fn new(namespace: impl Into<String>, max_entries: usize) -> Self {
        Self {
            namespace: namespace.into(),
            max_entries: max_entries.max(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SemanticIndex for KeywordIndex {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(
        &self,
        id: &str,
        text: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<(), MemoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let entry = KeywordEntry {
            text: text.to_string(),
            tokens: tokenize_to_set(text),
        };
        let mut entries = self.entries.write().map_err(index_lock)?;
        upsert_bounded(&mut entries, namespaced(&self.namespace, id), entry, self.max_entries);
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>, MemoryError> {
        let query_tokens = tokenize_to_set(query);
        if query_tokens.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().map_err(index_lock)?;
        let mut scored: Vec<(usize, f32, &str)> = entries
            .iter()
            .map(|(_, e)| {
                (
                    overlap_score(&query_tokens, &e.tokens),
                    jaccard_similarity(&query_tokens, &e.tokens),
                    e.text.as_str(),
                )
            })
            .filter(|(overlap, _, _)| *overlap > 0)
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, _, t)| t.to_string())
            .collect())
    }
}

// ---------------------------------------------------------------------------

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// 向量索引：嵌入失败即视为索引层失败，由 MemoryManager 降级
pub struct EmbeddingIndex {
    namespace: String,
    max_entries: usize,
    embedder: Arc<dyn EmbeddingProvider>,
    entries: RwLock<Vec<(String, (String, Vec<f32>))>>,
}

impl EmbeddingIndex {
    pub fn new(
        namespace: impl Into<String>,
        embedder: Arc<dyn EmbeddingProvider>,
        max_entries: usize,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            max_entries: max_entries.max(1),
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SemanticIndex for EmbeddingIndex {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn upsert(
        &self,
        id: &str,
        text: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<(), MemoryError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let vector = self.embedder.embed(text).await.map_err(MemoryError::Index)?;
        if vector.is_empty() {
            return Err(MemoryError::Index("empty embedding".to_string()));
        }
        let mut entries = self.entries.write().map_err(index_lock)?;
        upsert_bounded(
            &mut entries,
            namespaced(&self.namespace, id),
            (text.to_string(), vector),
            self.max_entries,
        );
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<String>, MemoryError> {
        if query.trim().is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let q = self.embedder.embed(query).await.map_err(MemoryError::Index)?;
        let entries = self.entries.read().map_err(index_lock)?;
        let mut scored: Vec<(f32, &str)> = entries
            .iter()
            .map(|(_, (text, v))| (cosine_similarity(&q, v), text.as_str()))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, t)| t.to_string())
            .collect())
    }
}
