//! Hive 构建器：统一的组件初始化逻辑
//!
//! 按配置组装模型客户端、三层记忆、工具与 Agent、反馈通道，最后得到可以直接 run 的 Hive。
//! 测试和嵌入方可以通过 with_* 注入自己的实现。

use std::sync::Arc;

use crate::agents::{AgentRegistry, ResponseSynthesizer, TaskDecomposer, ToolAgent};
use crate::config::{AppConfig, FeedbackMode};
use crate::core::{HiveError, Orchestrator, SessionResult};
use crate::feedback::{AutoApprove, FeedbackChannel, FeedbackGate, StdinFeedback};
use crate::llm::{create_embedder_from_config, LlmClient, OpenAiClient, RetryingLlmClient};
use crate::memory::{
    DurableLog, EmbeddingIndex, InMemoryDurableLog, InMemoryRecentCache, KeywordIndex, MemoryManager,
    SemanticIndex, SqliteDurableLog,
};
use crate::tools::{EchoTool, FetchTool, Tool, ToolExecutor, ToolRegistry, WeatherTool};

/// 每个会话在缓存里保留的迭代条数
const RECENT_CACHE_CAPACITY: usize = 100;

pub const RESEARCH_AGENT: &str = "ResearchExpert";
pub const WEATHER_AGENT: &str = "WeatherExpert";

/// 组装好的系统：编排器 + 配置
pub struct Hive {
    config: AppConfig,
    orchestrator: Orchestrator,
}

impl Hive {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        self.orchestrator.registry()
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        self.orchestrator.memory()
    }

    pub async fn run(&self, user_query: &str) -> SessionResult {
        self.orchestrator.run(user_query).await
    }
}

pub struct HiveBuilder {
    config: AppConfig,
    oracle: Option<Arc<dyn LlmClient>>,
    feedback: Option<Arc<dyn FeedbackChannel>>,
    durable: Option<Arc<dyn DurableLog>>,
    index: Option<Arc<dyn SemanticIndex>>,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            oracle: None,
            feedback: None,
            durable: None,
            index: None,
        }
    }

    /// 使用调用方提供的模型客户端（原样使用，不再包一层重试）
    pub fn with_oracle(mut self, oracle: Arc<dyn LlmClient>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_feedback(mut self, channel: Arc<dyn FeedbackChannel>) -> Self {
        self.feedback = Some(channel);
        self
    }

    pub fn with_durable_log(mut self, log: Arc<dyn DurableLog>) -> Self {
        self.durable = Some(log);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// 构建 LLM 客户端：OpenAI 兼容接口 + 重试与超时
    fn build_oracle(&self) -> Result<Arc<dyn LlmClient>, HiveError> {
        let llm = &self.config.llm;
        let key = llm.api_key().ok_or_else(|| {
            HiveError::Config(format!("no API key for provider '{}' (set OPENAI_API_KEY or DEEPSEEK_API_KEY)", llm.provider))
        })?;
        let base = llm.resolved_base_url();
        tracing::info!(provider = %llm.provider, model = %llm.model, "using OpenAI-compatible oracle");
        let client: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(base.as_deref(), &llm.model, Some(&key)));
        Ok(Arc::new(RetryingLlmClient::new(
            client,
            self.config.retry.clone(),
            llm.timeouts.request,
        )))
    }

    fn build_durable(&self) -> Result<Arc<dyn DurableLog>, HiveError> {
        match &self.config.memory.db_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "durable log: sqlite");
                Ok(Arc::new(SqliteDurableLog::open(path)?))
            }
            None => {
                tracing::info!("durable log: in-memory");
                Ok(Arc::new(InMemoryDurableLog::new()))
            }
        }
    }

    /// 有嵌入服务时用向量索引，否则用关键词索引
    fn build_index(&self) -> Arc<dyn SemanticIndex> {
        let mem = &self.config.memory;
        let llm = &self.config.llm;
        let embedder = if llm.enable_embeddings {
            let key = llm.api_key();
            create_embedder_from_config(llm.resolved_base_url().as_deref(), &llm.embedding_model, key.as_deref())
        } else {
            None
        };
        match embedder {
            Some(embedder) => Arc::new(EmbeddingIndex::new(
                mem.index_namespace.clone(),
                embedder,
                mem.index_max_entries,
            )),
            None => Arc::new(KeywordIndex::new(mem.index_namespace.clone(), mem.index_max_entries)),
        }
    }

    fn build_feedback(&self) -> Arc<dyn FeedbackChannel> {
        match self.config.feedback.mode {
            FeedbackMode::Auto => Arc::new(AutoApprove),
            FeedbackMode::Stdin => Arc::new(StdinFeedback::new(self.config.feedback.timeout_secs)),
        }
    }

    /// 注册默认 Agent 与工具
    fn register_agents(&self, registry: &AgentRegistry, oracle: &Arc<dyn LlmClient>, feedback: &Arc<FeedbackGate>) {
        let tools_cfg = &self.config.tools;

        let fetch: Arc<dyn Tool> = Arc::new(FetchTool::new(
            tools_cfg.fetch.allowed_domains.clone(),
            tools_cfg.fetch.timeout_secs,
            tools_cfg.fetch.max_result_chars,
        ));
        registry.register(
            Arc::new(ToolAgent::new(
                RESEARCH_AGENT,
                "Researches a topic by reading allow-listed web pages and reports the findings.",
                oracle.clone(),
            )),
            vec![fetch, Arc::new(EchoTool)],
        );

        if tools_cfg.weather_key().is_none() {
            tracing::warn!("no weather API key configured, get_forecast will fail");
        }
        registry.register(
            Arc::new(ToolAgent::new(
                WEATHER_AGENT,
                "Looks up the current weather and temperature for a city.",
                oracle.clone(),
            )),
            vec![Arc::new(WeatherTool::new(
                tools_cfg.weather_key().unwrap_or_default(),
                tools_cfg.tool_timeout_secs,
            ))],
        );

        registry.register(Arc::new(TaskDecomposer::new(oracle.clone(), feedback.clone())), vec![]);
        registry.register(Arc::new(ResponseSynthesizer::new(oracle.clone())), vec![]);
    }

    pub fn build(self) -> Result<Hive, HiveError> {
        let oracle = match &self.oracle {
            Some(oracle) => oracle.clone(),
            None => self.build_oracle()?,
        };
        let durable = match &self.durable {
            Some(log) => log.clone(),
            None => self.build_durable()?,
        };
        let index = match &self.index {
            Some(index) => index.clone(),
            None => self.build_index(),
        };
        let channel = match &self.feedback {
            Some(channel) => channel.clone(),
            None => self.build_feedback(),
        };

        let memory = Arc::new(MemoryManager::new(
            Arc::new(InMemoryRecentCache::new(RECENT_CACHE_CAPACITY)),
            durable,
            index,
            oracle.clone(),
            self.config.memory.policy(),
        ));
        let feedback = Arc::new(FeedbackGate::new(channel));

        let executor = Arc::new(ToolExecutor::new(
            Arc::new(ToolRegistry::new()),
            self.config.tools.tool_timeout_secs,
        ));
        let registry = Arc::new(AgentRegistry::new(executor));
        self.register_agents(&registry, &oracle, &feedback);
        tracing::info!(agents = registry.agents().len(), "agents registered");

        let orchestrator = Orchestrator::new(
            registry,
            memory,
            oracle,
            feedback,
            self.config.app.orchestrator(),
        );
        Ok(Hive {
            config: self.config,
            orchestrator,
        })
    }
}
