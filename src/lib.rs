//! Legion - LLM Agent 团队的计划派发与上下文预算
//!
//! 模块划分：
//! - **capability**: 能力注册表与执行指标
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 模型调用错误分类与恢复策略
//! - **llm**: 模型目录、单步执行抽象（StepRunner）、重试策略
//! - **memory**: Token 预算、上下文窗口分配、长期记忆召回
//! - **observability**: 日志初始化
//! - **state**: Agent 状态与 SQLite 版本化存储
//! - **workflow**: 执行计划、依赖图与派发引擎

pub mod capability;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod state;
pub mod workflow;

pub use capability::{Capability, CapabilityMetrics, CapabilityRegistry};
pub use workflow::{Dispatcher, ExecutionPlan, PlanExecutionResult};
