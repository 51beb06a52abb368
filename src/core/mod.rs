//! 核心编排层：错误、会话作用域、状态机、波次调度、主控循环与组装

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod state;
pub mod task_scheduler;

pub use builder::{Hive, HiveBuilder};
pub use error::HiveError;
pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionOutcome, SessionResult, ORCHESTRATOR_NAME};
pub use session::{SessionLimits, SessionScope};
pub use state::{PhaseTracker, SessionPhase};
pub use task_scheduler::{CompletedTasks, ScheduleReport, TaskScheduler, WaveOutcome};
