//! 会话作用域：一次 run 内所有 Agent 共享的 id、查询、迭代预算与记忆入口
//!
//! 迭代计数每次记录本地 +1，持久层返回值只做 max 合并；持久层写入失败时计数照常增长，
//! 迭代上限在后端故障时依然生效。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::memory::{ContextRequest, Iteration, MemoryManager, TaskContext};
use crate::workflow::TaskId;

/// 迭代上限
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// 全会话迭代上限
    pub max_iterations: u64,
    /// 单个 Agent 一次执行内的迭代上限
    pub max_agent_iterations: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            max_agent_iterations: 5,
        }
    }
}

pub struct SessionScope {
    session_id: String,
    user_query: String,
    limits: SessionLimits,
    memory: Arc<MemoryManager>,
    total: Arc<AtomicU64>,
}

impl SessionScope {
    pub fn new(
        session_id: impl Into<String>,
        user_query: impl Into<String>,
        memory: Arc<MemoryManager>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            user_query: user_query.into(),
            limits,
            memory,
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_query(&self) -> &str {
        &self.user_query
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn total_iterations(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// 全会话迭代预算是否已用完
    pub fn budget_exhausted(&self) -> bool {
        self.total_iterations() >= self.limits.max_iterations
    }

    /// 以本会话 id 开一条迭代记录
    pub fn iteration(&self, agent_name: &str) -> Iteration {
        Iteration::new(self.session_id.clone(), agent_name)
    }

    /// 记录一条迭代，返回会话累计迭代数
    ///
    /// 每次调用本地都 +1；持久层计数只做 max 合并（会话续跑时计数从持久层接上），
    /// 持久层间歇失败时它会落后于本地计数，不能覆盖本地值。
    pub async fn record(&self, iteration: Iteration) -> u64 {
        let local = self.total.fetch_add(1, Ordering::SeqCst) + 1;
        match self.memory.record_iteration(iteration).await {
            Ok(durable) if durable > local => {
                let prev = self.total.fetch_max(durable, Ordering::SeqCst);
                prev.max(durable)
            }
            Ok(_) => local,
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "durable log write failed, counting locally");
                local
            }
        }
    }

    /// 为任务组装记忆上下文
    pub async fn context_for(&self, agent_name: &str, task: &str, dependencies: &[TaskId]) -> TaskContext {
        self.memory
            .get_task_context(ContextRequest {
                session_id: &self.session_id,
                user_query: &self.user_query,
                agent_name,
                task,
                dependencies,
            })
            .await
    }
}
