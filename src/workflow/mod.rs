//! 执行计划：任务、校验、依赖图

pub mod builder;
pub mod graph;
pub mod types;

pub use builder::PlanBuilder;
pub use graph::DependencyGraph;
pub use types::*;
