//! 工具：注册表（参数校验 + 每 Agent 授权）、执行器（超时 + 审计日志）与具体工具

pub mod echo;
pub mod executor;
pub mod fetch;
pub mod registry;
pub mod schema;
pub mod weather;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use fetch::FetchTool;
pub use registry::{prepare_args, FnTool, ParamSpec, Tool, ToolRegistry};
pub use schema::reply_schema;
pub use weather::WeatherTool;
