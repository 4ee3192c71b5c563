//! LLM 层：模型目录、单步执行抽象（StepRunner / Mock）与重试策略

pub mod directory;
pub mod mock;
pub mod retry;
pub mod traits;

pub use directory::{DirectoryError, LatencyTier, ModelDirectory, ModelSpec, TaskQuery};
pub use mock::MockStepRunner;
pub use retry::RetryPolicy;
pub use traits::{StepRequest, StepRunner};
