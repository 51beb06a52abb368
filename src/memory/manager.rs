//! MemoryManager：组合三层记忆，为每个任务组装最小够用的上下文
//!
//! - 写入：RecentCache -> DurableLog -> SemanticIndex，然后检查摘要触发器
//! - 读取：无依赖的任务只拿最近历史；有依赖时先做意图分类，再按需附加摘要与检索结果
//! - 降级：索引失败则不带检索结果；持久层失败则只用缓存，且把错误返回给 record_iteration 的调用方；
//!   缓存失败则直接读持久层

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::llm::LlmClient;
use crate::memory::durable::DurableLog;
use crate::memory::recent::{RecentCache, SessionMeta};
use crate::memory::semantic::SemanticIndex;
use crate::memory::types::{
    ContextIntent, ConversationHistory, Iteration, MemoryError, SessionStatus, Summary,
    SummaryScope, TaskContext,
};
use crate::react::parser::{decode, truncate};
use crate::react::prompts;
use crate::workflow::TaskId;

/// 记忆策略参数
#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    /// 上下文里带多少条最近迭代
    pub recent_limit: usize,
    /// 每个范围写满多少条触发一次摘要
    pub summary_threshold: u64,
    pub rag_top_k: usize,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            recent_limit: 5,
            summary_threshold: 10,
            rag_top_k: 5,
        }
    }
}

/// 一次上下文请求
#[derive(Debug, Clone)]
pub struct ContextRequest<'a> {
    pub session_id: &'a str,
    pub user_query: &'a str,
    pub agent_name: &'a str,
    pub task: &'a str,
    /// 依赖任务 id；为空时走廉价路径
    pub dependencies: &'a [TaskId],
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    summary: String,
}

pub struct MemoryManager {
    cache: Arc<dyn RecentCache>,
    log: Arc<dyn DurableLog>,
    index: Arc<dyn SemanticIndex>,
    oracle: Arc<dyn LlmClient>,
    policy: MemoryPolicy,
    /// 串行化摘要生成，保证同一范围的区间首尾相接
    summarizer: Arc<Mutex<()>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
}

impl MemoryManager {
    pub fn new(
        cache: Arc<dyn RecentCache>,
        log: Arc<dyn DurableLog>,
        index: Arc<dyn SemanticIndex>,
        oracle: Arc<dyn LlmClient>,
        policy: MemoryPolicy,
    ) -> Self {
        Self {
            cache,
            log,
            index,
            oracle,
            policy,
            summarizer: Arc::new(Mutex::new(())),
            background: StdMutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.policy
    }

    /// 建立会话：缓存元数据 + 持久层会话行
    pub async fn initialize_session(&self, session_id: &str, user_query: &str) -> Result<(), MemoryError> {
        let meta = SessionMeta {
            session_id: session_id.to_string(),
            user_query: user_query.to_string(),
            status: SessionStatus::InProgress,
            total_iterations: 0,
        };
        if let Err(e) = self.cache.set_meta(meta).await {
            tracing::warn!(session = %session_id, error = %e, "recent cache unavailable at session start");
        }
        self.log.create_session(session_id, user_query).await
    }

    /// 标记会话完成（只会 InProgress -> Completed）
    pub async fn complete_session(&self, session_id: &str) -> Result<(), MemoryError> {
        match self.cache.meta(session_id).await {
            Ok(Some(meta)) => {
                let meta = SessionMeta {
                    status: SessionStatus::Completed,
                    ..meta
                };
                if let Err(e) = self.cache.set_meta(meta).await {
                    tracing::debug!(session = %session_id, error = %e, "recent cache meta not updated");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(session = %session_id, error = %e, "recent cache unavailable"),
        }
        self.log.complete_session(session_id).await
    }

    /// 追加一条迭代，返回会话累计迭代数
    ///
    /// 缓存失败只告警；持久层失败在缓存写入之后返回错误（此时不写索引、不触发摘要）；索引失败只告警。
    pub async fn record_iteration(&self, iteration: Iteration) -> Result<u64, MemoryError> {
        if let Err(e) = self.cache.push(&iteration).await {
            tracing::warn!(error = %e, "recent cache write failed");
        }

        self.log.insert_iteration(&iteration).await?;
        let total = self.log.increment_iteration_counter(&iteration.session_id).await?;

        if let Ok(Some(meta)) = self.cache.meta(&iteration.session_id).await {
            let meta = SessionMeta {
                total_iterations: total,
                ..meta
            };
            if let Err(e) = self.cache.set_meta(meta).await {
                tracing::debug!(session = %iteration.session_id, error = %e, "recent cache meta not updated");
            }
        }

        tracing::info!(
            target: "iteration",
            session = %iteration.session_id,
            total,
            agent = %iteration.agent_name,
            task_id = ?iteration.task_id,
            action = %iteration.action,
            status = iteration.status.as_str(),
            observation = %truncate(&iteration.observation, 120),
            "iteration recorded"
        );

        if self.index.enabled() {
            let mut metadata = HashMap::new();
            metadata.insert("session_id".to_string(), iteration.session_id.clone());
            metadata.insert("agent_name".to_string(), iteration.agent_name.clone());
            if let Some(t) = iteration.task_id {
                metadata.insert("task_id".to_string(), t.to_string());
            }
            let id = format!("{}:{}", iteration.session_id, total);
            if let Err(e) = self.index.upsert(&id, &iteration.index_text(), metadata).await {
                tracing::warn!(error = %e, "semantic index upsert failed");
            }
        }

        self.check_summary_trigger(&iteration).await;
        Ok(total)
    }

    /// 范围内条数到达阈值的非零倍数时，在后台生成 [上个摘要 end+1, count-1] 的摘要
    async fn check_summary_trigger(&self, iteration: &Iteration) {
        let threshold = self.policy.summary_threshold;
        if threshold == 0 {
            return;
        }
        let scope = iteration.scope();
        let count = match self.log.count_in_scope(&iteration.session_id, &scope).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "summary trigger skipped");
                return;
            }
        };
        if count == 0 || count % threshold != 0 {
            return;
        }

        let log = self.log.clone();
        let oracle = self.oracle.clone();
        let lock = self.summarizer.clone();
        let session_id = iteration.session_id.clone();
        let agent_name = iteration.agent_name.clone();
        let task_id = iteration.task_id;

        let handle = tokio::spawn(async move {
            let _guard = lock.lock().await;
            if let Err(e) =
                summarize_range(log.as_ref(), oracle.as_ref(), &session_id, &agent_name, task_id, &scope, count)
                    .await
            {
                tracing::warn!(session = %session_id, error = %e, "summarization failed");
            }
        });
        if let Ok(mut handles) = self.background.lock() {
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
        }
    }

    /// 等待所有后台摘要完成
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut h) => h.drain(..).collect(),
            Err(_) => return,
        };
        for h in handles {
            let _ = h.await;
        }
    }

    /// 会话结束后释放缓存槽位；持久层记录不受影响，之后的读取走持久层
    pub async fn release_session(&self, session_id: &str) {
        if let Err(e) = self.cache.evict(session_id).await {
            tracing::debug!(session = %session_id, error = %e, "recent cache slot not released");
        }
    }

    /// 最近 N 条：先读缓存，缓存失败或没有该会话（已释放、进程重启）时读持久层
    async fn recent_history(&self, session_id: &str) -> Vec<Iteration> {
        let limit = self.policy.recent_limit;
        match self.cache.recent(session_id, limit).await {
            Ok(recent) if !recent.is_empty() => return recent,
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "recent cache read failed, reading durable log"),
        }
        match self.log.query_iterations(session_id, None).await {
            Ok(all) => {
                let skip = all.len().saturating_sub(limit);
                all.into_iter().skip(skip).collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, "durable log read failed");
                Vec::new()
            }
        }
    }

    /// 为任务组装上下文；不会返回错误
    pub async fn get_task_context(&self, req: ContextRequest<'_>) -> TaskContext {
        let recent_history = self.recent_history(req.session_id).await;
        let mut context = TaskContext {
            user_query: req.user_query.to_string(),
            task: req.task.to_string(),
            recent_history,
            summary: None,
            rag_results: None,
        };

        if req.dependencies.is_empty() {
            return context;
        }

        let mut candidates = Vec::new();
        for dep in req.dependencies {
            match self.log.latest_summary(req.session_id, req.agent_name, Some(*dep)).await {
                Ok(Some(s)) => candidates.push(format!("[task {}] {}", dep, s.content)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "durable log unavailable, using recent history only");
                    return context;
                }
            }
        }

        let recent_text = context
            .recent_history
            .iter()
            .map(|i| i.render())
            .collect::<Vec<_>>()
            .join("\n");
        let intent = match self
            .oracle
            .generate(
                &prompts::intent_system(),
                &prompts::intent_content(
                    req.user_query,
                    req.task,
                    req.agent_name,
                    &candidates,
                    &recent_text,
                ),
            )
            .await
        {
            Ok(reply) => match decode::<ContextIntent>(&reply) {
                Ok(intent) => intent,
                Err(e) => {
                    tracing::warn!(error = %e, "intent reply malformed, using recent history only");
                    ContextIntent::recent_only()
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "intent classification failed, using recent history only");
                ContextIntent::recent_only()
            }
        };
        tracing::debug!(?intent, task = %req.task, "context intent");

        if intent.requires_summary && !candidates.is_empty() {
            context.summary = Some(candidates);
        }
        if intent.requires_rag && self.index.enabled() {
            let query = intent
                .rag_query
                .as_deref()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or(req.task);
            match self.index.search(query, self.policy.rag_top_k).await {
                Ok(hits) => context.rag_results = Some(hits),
                Err(e) => tracing::warn!(error = %e, "semantic search failed, skipping retrieval"),
            }
        }
        context
    }

    /// 完整会话历史；持久层不可用时退回缓存，都不可用时为空历史
    pub async fn get_complete_history(&self, session_id: &str) -> ConversationHistory {
        self.history(session_id, None).await
    }

    /// 指定任务的历史
    pub async fn get_task_history(&self, session_id: &str, task_ids: &[TaskId]) -> ConversationHistory {
        self.history(session_id, Some(task_ids)).await
    }

    async fn history(&self, session_id: &str, task_ids: Option<&[TaskId]>) -> ConversationHistory {
        let durable = async {
            let head = self.log.session(session_id).await?;
            let iterations = self.log.query_iterations(session_id, task_ids).await?;
            Ok::<_, MemoryError>((head, iterations))
        };
        match durable.await {
            Ok((head, iterations)) => {
                let mut history = head.unwrap_or_else(|| ConversationHistory::empty(session_id));
                history.iterations = iterations;
                history
            }
            Err(e) => {
                tracing::warn!(error = %e, "durable log unavailable, history from recent cache");
                let meta = self.cache.meta(session_id).await.ok().flatten();
                let recent = self
                    .cache
                    .recent(session_id, usize::MAX)
                    .await
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|it| match task_ids {
                        Some(ids) => it.task_id.map(|t| ids.contains(&t)).unwrap_or(false),
                        None => true,
                    })
                    .collect();
                match meta {
                    Some(m) => ConversationHistory {
                        session_id: m.session_id,
                        user_query: m.user_query,
                        iterations: recent,
                        total_iterations: m.total_iterations,
                        final_status: m.status,
                    },
                    None => ConversationHistory {
                        iterations: recent,
                        ..ConversationHistory::empty(session_id)
                    },
                }
            }
        }
    }
}

async fn summarize_range(
    log: &dyn DurableLog,
    oracle: &dyn LlmClient,
    session_id: &str,
    agent_name: &str,
    task_id: Option<TaskId>,
    scope: &SummaryScope,
    count: u64,
) -> Result<(), MemoryError> {
    let previous = log.latest_summary(session_id, agent_name, task_id).await?;
    let start_idx = previous.as_ref().map(|s| s.end_idx + 1).unwrap_or(0);
    let end_idx = count - 1;
    if end_idx < start_idx {
        return Ok(());
    }

    let in_scope: Vec<Iteration> = log
        .query_iterations(session_id, task_id.map(|t| vec![t]).as_deref())
        .await?
        .into_iter()
        .filter(|it| scope.matches(it))
        .collect();
    let slice: Vec<String> = in_scope
        .iter()
        .skip(start_idx as usize)
        .take((end_idx - start_idx + 1) as usize)
        .map(|it| it.render())
        .collect();

    let reply = oracle
        .generate(
            &prompts::summarizer_system(),
            &prompts::summarizer_content(
                &slice.join("\n"),
                previous.as_ref().map(|s| s.content.as_str()),
            ),
        )
        .await
        .map_err(|e| MemoryError::Durable(format!("summarizer oracle: {}", e)))?;
    let content = decode::<SummaryReply>(&reply)
        .map(|r| r.summary)
        .unwrap_or_else(|_| reply.trim().to_string());

    log.insert_summary(
        session_id,
        &Summary {
            agent_name: agent_name.to_string(),
            task_id,
            start_idx,
            end_idx,
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        },
    )
    .await?;
    tracing::info!(session = %session_id, agent = %agent_name, ?task_id, start_idx, end_idx, "summary stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::durable::InMemoryDurableLog;
    use crate::memory::recent::InMemoryRecentCache;
    use crate::memory::semantic::{KeywordIndex, NoopIndex};
    use crate::react::prompts::{INTENT_ROLE, SUMMARIZER_ROLE};
    use async_trait::async_trait;

    struct DownLog;

    #[async_trait]
    impl DurableLog for DownLog {
        async fn create_session(&self, _: &str, _: &str) -> Result<(), MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn complete_session(&self, _: &str) -> Result<(), MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn insert_iteration(&self, _: &Iteration) -> Result<(), MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn query_iterations(&self, _: &str, _: Option<&[TaskId]>) -> Result<Vec<Iteration>, MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn increment_iteration_counter(&self, _: &str) -> Result<u64, MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn count_in_scope(&self, _: &str, _: &SummaryScope) -> Result<u64, MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn insert_summary(&self, _: &str, _: &Summary) -> Result<(), MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn latest_summary(&self, _: &str, _: &str, _: Option<TaskId>) -> Result<Option<Summary>, MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
        async fn session(&self, _: &str) -> Result<Option<ConversationHistory>, MemoryError> {
            Err(MemoryError::Durable("down".into()))
        }
    }

    struct DownIndex;

    #[async_trait]
    impl SemanticIndex for DownIndex {
        fn namespace(&self) -> &str {
            "down"
        }
        async fn upsert(&self, _: &str, _: &str, _: HashMap<String, String>) -> Result<(), MemoryError> {
            Err(MemoryError::Index("down".into()))
        }
        async fn search(&self, _: &str, _: usize) -> Result<Vec<String>, MemoryError> {
            Err(MemoryError::Index("down".into()))
        }
    }

    struct DownCache;

    #[async_trait]
    impl RecentCache for DownCache {
        async fn push(&self, _: &Iteration) -> Result<(), MemoryError> {
            Err(MemoryError::Cache("down".into()))
        }
        async fn recent(&self, _: &str, _: usize) -> Result<Vec<Iteration>, MemoryError> {
            Err(MemoryError::Cache("down".into()))
        }
        async fn set_meta(&self, _: SessionMeta) -> Result<(), MemoryError> {
            Err(MemoryError::Cache("down".into()))
        }
        async fn meta(&self, _: &str) -> Result<Option<SessionMeta>, MemoryError> {
            Err(MemoryError::Cache("down".into()))
        }
        async fn evict(&self, _: &str) -> Result<(), MemoryError> {
            Err(MemoryError::Cache("down".into()))
        }
    }

    const WANTS_SUMMARY_AND_RAG: &str =
        "```json\n{\"requires_summary\": true, \"requires_rag\": true, \"rag_query\": \"fact number\", \"confidence\": 0.9}\n```";

    fn combine_request() -> ContextRequest<'static> {
        ContextRequest {
            session_id: "s1",
            user_query: "q",
            agent_name: "Synth",
            task: "combine",
            dependencies: &[1],
        }
    }

    fn manager_with(
        log: Arc<dyn DurableLog>,
        index: Arc<dyn SemanticIndex>,
        oracle: Arc<ScriptedLlmClient>,
        threshold: u64,
    ) -> MemoryManager {
        MemoryManager::new(
            Arc::new(InMemoryRecentCache::new(5)),
            log,
            index,
            oracle,
            MemoryPolicy {
                recent_limit: 3,
                summary_threshold: threshold,
                rag_top_k: 2,
            },
        )
    }

    fn it(task: Option<TaskId>, n: usize) -> Iteration {
        Iteration::new("s1", "Researcher")
            .with_task(task)
            .with_thought(format!("step {}", n))
            .with_observation(format!("found fact number {}", n))
    }

    #[tokio::test]
    async fn test_no_dependencies_skips_classification() {
        let oracle = Arc::new(ScriptedLlmClient::new());
        let mm = manager_with(Arc::new(InMemoryDurableLog::new()), Arc::new(NoopIndex), oracle.clone(), 10);
        mm.initialize_session("s1", "q").await.unwrap();
        for n in 0..4 {
            mm.record_iteration(it(Some(1), n)).await.unwrap();
        }
        let ctx = mm
            .get_task_context(ContextRequest {
                session_id: "s1",
                user_query: "q",
                agent_name: "Researcher",
                task: "t",
                dependencies: &[],
            })
            .await;
        assert_eq!(ctx.recent_history.len(), 3);
        assert!(ctx.summary.is_none() && ctx.rag_results.is_none());
        assert_eq!(oracle.call_count(), 0);
    }

    #[tokio::test]
    async fn test_intent_failure_degrades_to_recent_only() {
        let oracle = Arc::new(
            ScriptedLlmClient::new().on_error(INTENT_ROLE, LlmError::Network("down".into())),
        );
        let mm = manager_with(
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(KeywordIndex::new("t", 100)),
            oracle,
            10,
        );
        mm.record_iteration(it(Some(1), 0)).await.unwrap();
        let ctx = mm
            .get_task_context(ContextRequest {
                session_id: "s1",
                user_query: "q",
                agent_name: "Synth",
                task: "combine",
                dependencies: &[1],
            })
            .await;
        assert_eq!(ctx.recent_history.len(), 1);
        assert!(ctx.summary.is_none());
        assert!(ctx.rag_results.is_none());
    }

    #[tokio::test]
    async fn test_intent_selects_summary_and_rag() {
        let oracle = Arc::new(
            ScriptedLlmClient::new()
                .on(SUMMARIZER_ROLE, "```json\n{\"summary\": \"task one found facts\"}\n```")
                .on(
                    INTENT_ROLE,
                    "```json\n{\"requires_summary\": true, \"requires_rag\": true, \"rag_query\": \"fact number\", \"confidence\": 0.9}\n```",
                ),
        );
        let mm = manager_with(
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(KeywordIndex::new("t", 100)),
            oracle,
            2,
        );
        for n in 0..2 {
            mm.record_iteration(it(Some(1), n)).await.unwrap();
        }
        mm.flush().await;

        let ctx = mm
            .get_task_context(ContextRequest {
                session_id: "s1",
                user_query: "q",
                agent_name: "Synth",
                task: "combine",
                dependencies: &[1],
            })
            .await;
        assert_eq!(ctx.summary, Some(vec!["[task 1] task one found facts".to_string()]));
        let hits = ctx.rag_results.unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_summaries_are_contiguous() {
        let oracle = Arc::new(
            ScriptedLlmClient::new().on(SUMMARIZER_ROLE, "```json\n{\"summary\": \"s\"}\n```"),
        );
        let log = Arc::new(InMemoryDurableLog::new());
        let mm = manager_with(log.clone(), Arc::new(NoopIndex), oracle, 3);
        for n in 0..9 {
            mm.record_iteration(it(Some(7), n)).await.unwrap();
            mm.flush().await;
        }
        // 另一个范围不影响本范围计数
        mm.record_iteration(it(None, 99)).await.unwrap();
        mm.flush().await;

        let latest = log.latest_summary("s1", "Researcher", Some(7)).await.unwrap().unwrap();
        assert_eq!((latest.start_idx, latest.end_idx), (6, 8));
        assert!(log.latest_summary("s1", "Researcher", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_summary_oracle_failure_widens_next_range() {
        let oracle = Arc::new(
            ScriptedLlmClient::new()
                .on_error(SUMMARIZER_ROLE, LlmError::Api("bad".into()))
                .on(SUMMARIZER_ROLE, "```json\n{\"summary\": \"s\"}\n```"),
        );
        let log = Arc::new(InMemoryDurableLog::new());
        let mm = manager_with(log.clone(), Arc::new(NoopIndex), oracle, 2);
        for n in 0..4 {
            mm.record_iteration(it(Some(1), n)).await.unwrap();
            mm.flush().await;
        }
        let latest = log.latest_summary("s1", "Researcher", Some(1)).await.unwrap().unwrap();
        assert_eq!((latest.start_idx, latest.end_idx), (0, 3));
    }

    #[tokio::test]
    async fn test_durable_failure_surfaces_but_cache_still_serves() {
        let oracle = Arc::new(ScriptedLlmClient::new());
        let mm = manager_with(Arc::new(DownLog), Arc::new(NoopIndex), oracle, 10);
        assert!(mm.initialize_session("s1", "q").await.is_err());
        let err = mm.record_iteration(it(Some(1), 0)).await.unwrap_err();
        assert!(matches!(err, MemoryError::Durable(_)));

        let ctx = mm
            .get_task_context(ContextRequest {
                session_id: "s1",
                user_query: "q",
                agent_name: "Synth",
                task: "combine",
                dependencies: &[1],
            })
            .await;
        assert_eq!(ctx.recent_history.len(), 1);
        assert!(ctx.summary.is_none());

        let history = mm.get_complete_history("s1").await;
        assert_eq!(history.iterations.len(), 1);
        assert_eq!(history.user_query, "q");
    }

    #[tokio::test]
    async fn test_history_queries_and_completion() {
        let oracle = Arc::new(ScriptedLlmClient::new());
        let mm = manager_with(Arc::new(InMemoryDurableLog::new()), Arc::new(NoopIndex), oracle, 10);
        mm.initialize_session("s1", "q").await.unwrap();
        mm.record_iteration(it(Some(1), 0)).await.unwrap();
        mm.record_iteration(it(Some(2), 1)).await.unwrap();
        let total = mm.record_iteration(it(None, 2)).await.unwrap();
        assert_eq!(total, 3);

        let full = mm.get_complete_history("s1").await;
        assert_eq!(full.iterations.len(), 3);
        assert_eq!(full.total_iterations, 3);
        assert_eq!(full.final_status, SessionStatus::InProgress);

        let task_two = mm.get_task_history("s1", &[2]).await;
        assert_eq!(task_two.iterations.len(), 1);

        mm.complete_session("s1").await.unwrap();
        assert_eq!(mm.get_complete_history("s1").await.final_status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_index_failure_leaves_rag_empty() {
        let oracle = Arc::new(ScriptedLlmClient::new().on(INTENT_ROLE, WANTS_SUMMARY_AND_RAG));
        let mm = manager_with(Arc::new(InMemoryDurableLog::new()), Arc::new(DownIndex), oracle.clone(), 10);
        mm.initialize_session("s1", "q").await.unwrap();
        // upsert 失败不影响写入
        for n in 0..2 {
            assert_eq!(mm.record_iteration(it(Some(1), n)).await.unwrap(), n as u64 + 1);
        }

        let ctx = mm.get_task_context(combine_request()).await;
        assert_eq!(oracle.calls_matching(INTENT_ROLE), 1);
        assert_eq!(ctx.recent_history.len(), 2);
        assert!(ctx.rag_results.is_none());
    }

    #[tokio::test]
    async fn test_cache_failure_reads_recent_from_durable_log() {
        let log = Arc::new(InMemoryDurableLog::new());
        let mm = MemoryManager::new(
            Arc::new(DownCache),
            log.clone(),
            Arc::new(NoopIndex),
            Arc::new(ScriptedLlmClient::new()),
            MemoryPolicy {
                recent_limit: 3,
                summary_threshold: 10,
                rag_top_k: 2,
            },
        );
        mm.initialize_session("s1", "q").await.unwrap();
        for n in 0..5 {
            mm.record_iteration(it(Some(1), n)).await.unwrap();
        }
        mm.complete_session("s1").await.unwrap();
        mm.release_session("s1").await;

        let ctx = mm.get_task_context(combine_request()).await;
        let thoughts: Vec<_> = ctx.recent_history.iter().map(|i| i.thought.as_str()).collect();
        assert_eq!(thoughts, vec!["step 2", "step 3", "step 4"]);

        let history = mm.get_complete_history("s1").await;
        assert_eq!(history.iterations.len(), 5);
        assert_eq!(history.final_status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_released_session_still_served_from_durable_log() {
        let oracle = Arc::new(ScriptedLlmClient::new());
        let cache = Arc::new(InMemoryRecentCache::new(5));
        let mm = MemoryManager::new(
            cache.clone(),
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(NoopIndex),
            oracle,
            MemoryPolicy {
                recent_limit: 3,
                summary_threshold: 10,
                rag_top_k: 2,
            },
        );
        mm.initialize_session("s1", "q").await.unwrap();
        for n in 0..4 {
            mm.record_iteration(it(Some(1), n)).await.unwrap();
        }

        mm.release_session("s1").await;
        assert!(cache.meta("s1").await.unwrap().is_none());
        assert!(cache.recent("s1", 5).await.unwrap().is_empty());

        let ctx = mm
            .get_task_context(ContextRequest {
                dependencies: &[],
                ..combine_request()
            })
            .await;
        assert_eq!(ctx.recent_history.len(), 3);
        assert_eq!(ctx.recent_history[2].thought, "step 3");
    }
}
