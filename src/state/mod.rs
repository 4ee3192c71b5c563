//! 状态层：模型无关的 Agent 状态与版本化持久化

pub mod schema;
pub mod store;

pub use schema::{AgentState, ErrorRecord, StateError, StepCompletion, StepRecord, StepStatus};
pub use store::{SqliteStateStore, StateStore, StoreError, StoreStats, DEFAULT_MAX_HISTORY};
