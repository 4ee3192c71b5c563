//! 工作流层：执行计划模型、依赖图、构建器与派发引擎

pub mod builder;
pub mod engine;
pub mod events;
pub mod graph;
pub mod result;
pub mod types;

pub use builder::PlanBuilder;
pub use engine::{
    DispatchSettings, Dispatcher, StateBinding, DEFAULT_FALLBACK_MODEL, DEFAULT_PRIMARY_MODEL,
};
pub use events::DispatchEvent;
pub use graph::PlanGraph;
pub use result::{DispatchOutcome, FinalOutputSource, PlanExecutionResult, StepResult};
pub use types::*;
