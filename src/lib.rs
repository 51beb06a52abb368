//! Hive - Rust 多智能体编排系统
//!
//! 模块划分：
//! - **agents**: Agent 接口、注册表（失败边界）、通用工具 Agent、任务分解、响应综合
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话作用域、状态机、波次调度、主控循环、组装
//! - **feedback**: 人工反馈通道与反馈闸门
//! - **llm**: LLM 客户端抽象、OpenAI 兼容实现、重试包装、嵌入、脚本化测试客户端
//! - **memory**: 最近缓存 / 持久日志 / 语义索引三层记忆与 MemoryManager
//! - **observability**: 日志初始化
//! - **react**: 模型回复解码、提示词、Planner、Critic
//! - **tools**: 工具箱（echo、get_forecast、fetch_url）与执行器
//! - **workflow**: 任务图、执行计划校验与构建

pub mod agents;
pub mod config;
pub mod core;
pub mod feedback;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
pub mod workflow;

pub use crate::config::{load_config, AppConfig};
pub use crate::core::{Hive, HiveBuilder, HiveError, SessionOutcome, SessionResult};
