//! 核心层：模型调用错误分类与恢复策略

pub mod error;
pub mod recovery;

pub use error::{CallError, CallErrorKind, RecoveryAction};
pub use recovery::RecoveryEngine;
