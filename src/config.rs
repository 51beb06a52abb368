//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__APP__MAX_ITERATIONS=50`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::{OrchestratorConfig, SessionLimits};
use crate::llm::RetryConfig;
use crate::memory::MemoryPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub memory: MemorySection,
    pub llm: LlmSection,
    pub retry: RetryConfig,
    pub tools: ToolsSection,
    pub feedback: FeedbackSection,
}

/// [app] 段：迭代上限与计划重试次数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 全会话迭代上限
    pub max_iterations: u64,
    /// 单个 Agent 一次执行内的迭代上限
    pub max_agent_iterations: u32,
    /// 连续无效计划的重试次数
    pub max_plan_retries: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            max_iterations: 30,
            max_agent_iterations: 5,
            max_plan_retries: 3,
        }
    }
}

impl AppSection {
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            limits: SessionLimits {
                max_iterations: self.max_iterations,
                max_agent_iterations: self.max_agent_iterations,
            },
            max_plan_retries: self.max_plan_retries,
        }
    }
}

/// [memory] 段：摘要阈值、最近记录条数、检索条数、持久层与索引
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub summary_threshold: u64,
    pub recent_limit: usize,
    pub rag_top_k: usize,
    /// SQLite 文件路径；未设置时用内存后端
    pub db_path: Option<PathBuf>,
    pub index_namespace: String,
    pub index_max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            summary_threshold: 10,
            recent_limit: 5,
            rag_top_k: 5,
            db_path: None,
            index_namespace: "default".to_string(),
            index_max_entries: 1000,
        }
    }
}

impl MemorySection {
    pub fn policy(&self) -> MemoryPolicy {
        MemoryPolicy {
            recent_limit: self.recent_limit,
            summary_threshold: self.summary_threshold,
            rag_top_k: self.rag_top_k,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek（都走 OpenAI 兼容接口）
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub embedding_model: String,
    /// 关闭后语义索引退回关键词匹配
    pub enable_embeddings: bool,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
            enable_embeddings: true,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

impl LlmSection {
    /// API Key：provider 对应的环境变量优先，其次 OPENAI_API_KEY
    pub fn api_key(&self) -> Option<String> {
        let var = match self.provider.to_lowercase().as_str() {
            "deepseek" => "DEEPSEEK_API_KEY",
            _ => "OPENAI_API_KEY",
        };
        std::env::var(var)
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    /// deepseek 未显式配置 base_url 时使用官方端点
    pub fn resolved_base_url(&self) -> Option<String> {
        match (&self.base_url, self.provider.to_lowercase().as_str()) {
            (Some(url), _) => Some(url.clone()),
            (None, "deepseek") => Some("https://api.deepseek.com/v1".to_string()),
            (None, _) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次模型调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [tools] 段：工具超时、天气 API Key、抓取白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 未设置时读 OPENWEATHER_API_KEY
    pub weather_api_key: Option<String>,
    pub fetch: FetchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            weather_api_key: None,
            fetch: FetchSection::default(),
        }
    }
}

impl ToolsSection {
    pub fn weather_key(&self) -> Option<String> {
        self.weather_api_key
            .clone()
            .or_else(|| std::env::var("OPENWEATHER_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// [tools.fetch] 段：抓取 URL 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "en.wikipedia.org".into(),
        "zh.wikipedia.org".into(),
        "github.com".into(),
        "raw.githubusercontent.com".into(),
        "stackoverflow.com".into(),
        "docs.rs".into(),
        "doc.rust-lang.org".into(),
        "developer.mozilla.org".into(),
        "arxiv.org".into(),
        "news.ycombinator.com".into(),
        "openweathermap.org".into(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackMode {
    /// 不询问，一律继续
    #[default]
    Auto,
    /// 在终端询问
    Stdin,
}

/// [feedback] 段：人工反馈方式
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackSection {
    pub mode: FeedbackMode,
    /// stdin 模式下等待输入的秒数，超时视为继续
    pub timeout_secs: u64,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            mode: FeedbackMode::Auto,
            timeout_secs: 300,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载失败时告警并使用默认配置
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_iterations, 30);
        assert_eq!(cfg.app.max_agent_iterations, 5);
        assert_eq!(cfg.app.max_plan_retries, 3);
        assert_eq!(cfg.memory.summary_threshold, 10);
        assert_eq!(cfg.memory.recent_limit, 5);
        assert_eq!(cfg.memory.index_namespace, "default");
        assert!(cfg.memory.db_path.is_none());
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.feedback.mode, FeedbackMode::Auto);
    }

    #[test]
    fn test_explicit_file_overrides_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[app]
max_iterations = 12

[memory]
summary_threshold = 4
db_path = "hive.db"

[feedback]
mode = "stdin"
"#
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.max_iterations, 12);
        // 未写的键保持默认
        assert_eq!(cfg.app.max_agent_iterations, 5);
        assert_eq!(cfg.memory.summary_threshold, 4);
        assert_eq!(cfg.memory.db_path, Some(PathBuf::from("hive.db")));
        assert_eq!(cfg.feedback.mode, FeedbackMode::Stdin);
        assert_eq!(cfg.app.orchestrator().limits.max_iterations, 12);
    }
}
