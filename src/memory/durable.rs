//! 持久化日志层：只追加的迭代记录 + 摘要，按会话/任务查询
//!
//! 两个实现：SqliteDurableLog（rusqlite，同步连接放进 spawn_blocking）与 InMemoryDurableLog。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::memory::types::{
    ConversationHistory, Iteration, IterationStatus, MemoryError, SessionStatus, Summary,
    SummaryScope,
};
use crate::workflow::TaskId;

#[async_trait]
pub trait DurableLog: Send + Sync {
    /// 创建会话行（已存在时只更新问题文本，不重置计数）
    async fn create_session(&self, session_id: &str, user_query: &str) -> Result<(), MemoryError>;

    /// 标记会话完成；只能 InProgress -> Completed
    async fn complete_session(&self, session_id: &str) -> Result<(), MemoryError>;

    async fn insert_iteration(&self, iteration: &Iteration) -> Result<(), MemoryError>;

    /// 按写入顺序返回；task_ids 为 Some 时只返回这些任务的记录
    async fn query_iterations(
        &self,
        session_id: &str,
        task_ids: Option<&[TaskId]>,
    ) -> Result<Vec<Iteration>, MemoryError>;

    /// 会话计数 +1 并返回新值
    async fn increment_iteration_counter(&self, session_id: &str) -> Result<u64, MemoryError>;

    /// 某个摘要范围内已写入的迭代条数
    async fn count_in_scope(&self, session_id: &str, scope: &SummaryScope) -> Result<u64, MemoryError>;

    async fn insert_summary(&self, session_id: &str, summary: &Summary) -> Result<(), MemoryError>;

    async fn latest_summary(
        &self,
        session_id: &str,
        agent_name: &str,
        task_id: Option<TaskId>,
    ) -> Result<Option<Summary>, MemoryError>;

    /// 会话头信息（不含迭代）
    async fn session(&self, session_id: &str) -> Result<Option<ConversationHistory>, MemoryError>;
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// SQLite 实现：单连接 + Mutex，所有操作在阻塞线程池中执行
pub struct SqliteDurableLog {
    conn: Arc<Mutex<Connection>>,
}

fn sql_err(e: rusqlite::Error) -> MemoryError {
    MemoryError::Durable(e.to_string())
}

impl SqliteDurableLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, MemoryError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_query TEXT NOT NULL,
                total_iterations INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'InProgress',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS iterations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                task_id INTEGER,
                thought TEXT NOT NULL,
                action TEXT NOT NULL,
                action_input TEXT NOT NULL,
                observation TEXT NOT NULL,
                tool_call_requires INTEGER NOT NULL,
                status TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_iterations_session ON iterations(session_id);
            CREATE TABLE IF NOT EXISTS summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                task_id INTEGER,
                start_idx INTEGER NOT NULL,
                end_idx INTEGER NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries(session_id);",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MemoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| MemoryError::Durable("sqlite connection lock poisoned".to_string()))?;
            f(&guard).map_err(sql_err)
        })
        .await
        .map_err(|e| MemoryError::Durable(format!("blocking task failed: {}", e)))?
    }

    fn row_to_iteration(row: &rusqlite::Row<'_>) -> rusqlite::Result<Iteration> {
        let task_id: Option<i64> = row.get(2)?;
        let action_input: String = row.get(5)?;
        let status: String = row.get(8)?;
        let tool_call: i64 = row.get(7)?;
        Ok(Iteration {
            session_id: row.get(0)?,
            agent_name: row.get(1)?,
            task_id: task_id.map(|t| t as TaskId),
            thought: row.get(3)?,
            action: row.get(4)?,
            action_input: serde_json::from_str(&action_input).unwrap_or(serde_json::Value::Null),
            observation: row.get(6)?,
            tool_call_requires: tool_call != 0,
            status: IterationStatus::parse_lenient(&status),
            timestamp: row.get(9)?,
        })
    }
}

#[async_trait]
impl DurableLog for SqliteDurableLog {
    async fn create_session(&self, session_id: &str, user_query: &str) -> Result<(), MemoryError> {
        let (id, query) = (session_id.to_string(), user_query.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_query, total_iterations, status, created_at)
                 VALUES (?1, ?2, 0, 'InProgress', ?3)
                 ON CONFLICT(id) DO UPDATE SET user_query = excluded.user_query",
                params![id, query, chrono::Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn complete_session(&self, session_id: &str) -> Result<(), MemoryError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE sessions SET status = 'Completed' WHERE id = ?1",
                params![id],
            )
            .map(|_| ())
        })
        .await
    }

    async fn insert_iteration(&self, iteration: &Iteration) -> Result<(), MemoryError> {
        let it = iteration.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO iterations (session_id, agent_name, task_id, thought, action, action_input,
                 observation, tool_call_requires, status, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    it.session_id,
                    it.agent_name,
                    it.task_id.map(|t| t as i64),
                    it.thought,
                    it.action,
                    it.action_input.to_string(),
                    it.observation,
                    it.tool_call_requires as i64,
                    it.status.as_str(),
                    it.timestamp,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn query_iterations(
        &self,
        session_id: &str,
        task_ids: Option<&[TaskId]>,
    ) -> Result<Vec<Iteration>, MemoryError> {
        let id = session_id.to_string();
        let filter: Option<Vec<TaskId>> = task_ids.map(|t| t.to_vec());
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, agent_name, task_id, thought, action, action_input,
                     observation, tool_call_requires, status, timestamp
                     FROM iterations WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![id], Self::row_to_iteration)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;
        Ok(match filter {
            Some(ids) => rows
                .into_iter()
                .filter(|it| it.task_id.map(|t| ids.contains(&t)).unwrap_or(false))
                .collect(),
            None => rows,
        })
    }

    async fn increment_iteration_counter(&self, session_id: &str) -> Result<u64, MemoryError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_query, total_iterations, status, created_at)
                 VALUES (?1, '', 1, 'InProgress', ?2)
                 ON CONFLICT(id) DO UPDATE SET total_iterations = total_iterations + 1",
                params![id, chrono::Utc::now().to_rfc3339()],
            )?;
            let total: i64 = conn.query_row(
                "SELECT total_iterations FROM sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(total.max(0) as u64)
        })
        .await
    }

    async fn count_in_scope(&self, session_id: &str, scope: &SummaryScope) -> Result<u64, MemoryError> {
        let id = session_id.to_string();
        let scope = scope.clone();
        self.with_conn(move |conn| {
            let count: i64 = match scope {
                SummaryScope::Task(task_id) => conn.query_row(
                    "SELECT COUNT(*) FROM iterations WHERE session_id = ?1 AND task_id = ?2",
                    params![id, task_id as i64],
                    |row| row.get(0),
                )?,
                SummaryScope::Agent(agent) => conn.query_row(
                    "SELECT COUNT(*) FROM iterations
                     WHERE session_id = ?1 AND agent_name = ?2 AND task_id IS NULL",
                    params![id, agent],
                    |row| row.get(0),
                )?,
            };
            Ok(count.max(0) as u64)
        })
        .await
    }

    async fn insert_summary(&self, session_id: &str, summary: &Summary) -> Result<(), MemoryError> {
        let id = session_id.to_string();
        let s = summary.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO summaries (session_id, agent_name, task_id, start_idx, end_idx, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    s.agent_name,
                    s.task_id.map(|t| t as i64),
                    s.start_idx as i64,
                    s.end_idx as i64,
                    s.content,
                    s.timestamp,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn latest_summary(
        &self,
        session_id: &str,
        agent_name: &str,
        task_id: Option<TaskId>,
    ) -> Result<Option<Summary>, MemoryError> {
        let id = session_id.to_string();
        let agent = agent_name.to_string();
        self.with_conn(move |conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<Summary> {
                let task: Option<i64> = row.get(1)?;
                let start: i64 = row.get(2)?;
                let end: i64 = row.get(3)?;
                Ok(Summary {
                    agent_name: row.get(0)?,
                    task_id: task.map(|t| t as TaskId),
                    start_idx: start as u64,
                    end_idx: end as u64,
                    content: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            };
            match task_id {
                Some(t) => conn
                    .query_row(
                        "SELECT agent_name, task_id, start_idx, end_idx, content, timestamp
                         FROM summaries WHERE session_id = ?1 AND task_id = ?2
                         ORDER BY end_idx DESC LIMIT 1",
                        params![id, t as i64],
                        map_row,
                    )
                    .optional(),
                None => conn
                    .query_row(
                        "SELECT agent_name, task_id, start_idx, end_idx, content, timestamp
                         FROM summaries WHERE session_id = ?1 AND agent_name = ?2 AND task_id IS NULL
                         ORDER BY end_idx DESC LIMIT 1",
                        params![id, agent],
                        map_row,
                    )
                    .optional(),
            }
        })
        .await
    }

    async fn session(&self, session_id: &str) -> Result<Option<ConversationHistory>, MemoryError> {
        let id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, user_query, total_iterations, status FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    let total: i64 = row.get(2)?;
                    let status: String = row.get(3)?;
                    Ok(ConversationHistory {
                        session_id: row.get(0)?,
                        user_query: row.get(1)?,
                        iterations: Vec::new(),
                        total_iterations: total.max(0) as u64,
                        final_status: SessionStatus::from_db(&status),
                    })
                },
            )
            .optional()
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionLog {
    user_query: String,
    total_iterations: u64,
    status: SessionStatus,
    iterations: Vec<Iteration>,
    summaries: Vec<Summary>,
}

/// 内存实现：未配置 db_path 时使用，也用于测试
#[derive(Debug, Default)]
pub struct InMemoryDurableLog {
    sessions: RwLock<HashMap<String, SessionLog>>,
}

impl InMemoryDurableLog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err<T>(_: T) -> MemoryError {
    MemoryError::Durable("durable log lock poisoned".to_string())
}

#[async_trait]
impl DurableLog for InMemoryDurableLog {
    async fn create_session(&self, session_id: &str, user_query: &str) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        sessions.entry(session_id.to_string()).or_default().user_query = user_query.to_string();
        Ok(())
    }

    async fn complete_session(&self, session_id: &str) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        if let Some(log) = sessions.get_mut(session_id) {
            log.status = SessionStatus::Completed;
        }
        Ok(())
    }

    async fn insert_iteration(&self, iteration: &Iteration) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        sessions
            .entry(iteration.session_id.clone())
            .or_default()
            .iterations
            .push(iteration.clone());
        Ok(())
    }

    async fn query_iterations(
        &self,
        session_id: &str,
        task_ids: Option<&[TaskId]>,
    ) -> Result<Vec<Iteration>, MemoryError> {
        let sessions = self.sessions.read().map_err(lock_err)?;
        let Some(log) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iterations
            .iter()
            .filter(|it| match task_ids {
                Some(ids) => it.task_id.map(|t| ids.contains(&t)).unwrap_or(false),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn increment_iteration_counter(&self, session_id: &str) -> Result<u64, MemoryError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        let log = sessions.entry(session_id.to_string()).or_default();
        log.total_iterations += 1;
        Ok(log.total_iterations)
    }

    async fn count_in_scope(&self, session_id: &str, scope: &SummaryScope) -> Result<u64, MemoryError> {
        let sessions = self.sessions.read().map_err(lock_err)?;
        Ok(sessions
            .get(session_id)
            .map(|log| log.iterations.iter().filter(|it| scope.matches(it)).count() as u64)
            .unwrap_or(0))
    }

    async fn insert_summary(&self, session_id: &str, summary: &Summary) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().map_err(lock_err)?;
        sessions
            .entry(session_id.to_string())
            .or_default()
            .summaries
            .push(summary.clone());
        Ok(())
    }

    async fn latest_summary(
        &self,
        session_id: &str,
        agent_name: &str,
        task_id: Option<TaskId>,
    ) -> Result<Option<Summary>, MemoryError> {
        let sessions = self.sessions.read().map_err(lock_err)?;
        Ok(sessions.get(session_id).and_then(|log| {
            log.summaries
                .iter()
                .filter(|s| match task_id {
                    Some(t) => s.task_id == Some(t),
                    None => s.task_id.is_none() && s.agent_name == agent_name,
                })
                .max_by_key(|s| s.end_idx)
                .cloned()
        }))
    }

    async fn session(&self, session_id: &str) -> Result<Option<ConversationHistory>, MemoryError> {
        let sessions = self.sessions.read().map_err(lock_err)?;
        Ok(sessions.get(session_id).map(|log| ConversationHistory {
            session_id: session_id.to_string(),
            user_query: log.user_query.clone(),
            iterations: Vec::new(),
            total_iterations: log.total_iterations,
            final_status: log.status,
        }))
    }
}
