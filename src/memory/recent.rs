//! 短期缓存层：每个会话保留最近 N 条迭代 + 会话元数据
//!
//! 超出容量时丢弃最旧的记录（环形缓冲）。缓存只是加速层，丢失不影响正确性，
//! MemoryManager 在缓存失败时会直接读 DurableLog，会话结束时整槽释放。

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::memory::types::{Iteration, MemoryError, SessionStatus};

/// 会话元数据（缓存中的轻量副本）
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_query: String,
    pub status: SessionStatus,
    pub total_iterations: u64,
}

#[async_trait]
pub trait RecentCache: Send + Sync {
    async fn push(&self, iteration: &Iteration) -> Result<(), MemoryError>;

    /// 最近 limit 条，按时间正序
    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<Iteration>, MemoryError>;

    async fn set_meta(&self, meta: SessionMeta) -> Result<(), MemoryError>;

    async fn meta(&self, session_id: &str) -> Result<Option<SessionMeta>, MemoryError>;

    /// 丢弃会话的全部缓存（迭代与元数据）
    async fn evict(&self, session_id: &str) -> Result<(), MemoryError>;
}

#[derive(Debug, Default)]
struct Slot {
    meta: Option<SessionMeta>,
    ring: VecDeque<Iteration>,
}

/// 进程内环形缓存
#[derive(Debug)]
pub struct InMemoryRecentCache {
    capacity: usize,
    slots: RwLock<HashMap<String, Slot>>,
}

impl InMemoryRecentCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: RwLock::new(HashMap::new()),
        }
    }
}

fn poisoned<T>(_: T) -> MemoryError {
    MemoryError::Cache("recent cache lock poisoned".to_string())
}

#[async_trait]
impl RecentCache for InMemoryRecentCache {
    async fn push(&self, iteration: &Iteration) -> Result<(), MemoryError> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        let slot = slots.entry(iteration.session_id.clone()).or_default();
        slot.ring.push_back(iteration.clone());
        while slot.ring.len() > self.capacity {
            slot.ring.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<Iteration>, MemoryError> {
        let slots = self.slots.read().map_err(poisoned)?;
        Ok(slots
            .get(session_id)
            .map(|slot| {
                let skip = slot.ring.len().saturating_sub(limit);
                slot.ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn set_meta(&self, meta: SessionMeta) -> Result<(), MemoryError> {
        let mut slots = self.slots.write().map_err(poisoned)?;
        let slot = slots.entry(meta.session_id.clone()).or_default();
        // 已完成的会话不回退
        let status = match &slot.meta {
            Some(old) if old.status == SessionStatus::Completed => SessionStatus::Completed,
            _ => meta.status,
        };
        let total = slot
            .meta
            .as_ref()
            .map(|old| old.total_iterations.max(meta.total_iterations))
            .unwrap_or(meta.total_iterations);
        slot.meta = Some(SessionMeta {
            status,
            total_iterations: total,
            ..meta
        });
        Ok(())
    }

    async fn meta(&self, session_id: &str) -> Result<Option<SessionMeta>, MemoryError> {
        let slots = self.slots.read().map_err(poisoned)?;
        Ok(slots.get(session_id).and_then(|s| s.meta.clone()))
    }

    async fn evict(&self, session_id: &str) -> Result<(), MemoryError> {
        self.slots.write().map_err(poisoned)?.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ring_keeps_latest() {
        let cache = InMemoryRecentCache::new(3);
        for i in 0..5 {
            let it = Iteration::new("s1", "A").with_thought(format!("t{}", i));
            cache.push(&it).await.unwrap();
        }
        let recent = cache.recent("s1", 10).await.unwrap();
        let thoughts: Vec<_> = recent.iter().map(|i| i.thought.as_str()).collect();
        assert_eq!(thoughts, vec!["t2", "t3", "t4"]);

        let last_two = cache.recent("s1", 2).await.unwrap();
        assert_eq!(last_two[0].thought, "t3");
        assert!(cache.recent("other", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_meta_never_reverts_completed() {
        let cache = InMemoryRecentCache::new(3);
        let meta = SessionMeta {
            session_id: "s1".into(),
            user_query: "q".into(),
            status: SessionStatus::Completed,
            total_iterations: 4,
        };
        cache.set_meta(meta.clone()).await.unwrap();
        cache
            .set_meta(SessionMeta {
                status: SessionStatus::InProgress,
                total_iterations: 2,
                ..meta
            })
            .await
            .unwrap();
        let got = cache.meta("s1").await.unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Completed);
        assert_eq!(got.total_iterations, 4);
    }

    #[tokio::test]
    async fn test_evict_drops_only_that_session() {
        let cache = InMemoryRecentCache::new(3);
        cache.push(&Iteration::new("s1", "A")).await.unwrap();
        cache.push(&Iteration::new("s2", "A")).await.unwrap();
        cache
            .set_meta(SessionMeta {
                session_id: "s1".into(),
                user_query: "q".into(),
                status: SessionStatus::Completed,
                total_iterations: 1,
            })
            .await
            .unwrap();

        cache.evict("s1").await.unwrap();
        cache.evict("missing").await.unwrap();

        assert!(cache.recent("s1", 5).await.unwrap().is_empty());
        assert!(cache.meta("s1").await.unwrap().is_none());
        assert_eq!(cache.recent("s2", 5).await.unwrap().len(), 1);
    }
}
