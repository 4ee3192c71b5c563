//! 模型调用错误与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 CallError 决定 Retry / DowngradeModel / Abort。

use std::time::Duration;

use thiserror::Error;

/// 外部「执行单步」能力返回的错误，由调用方在产生时完成分类
///
/// Display 只输出原始错误文本，方便在 StepResult 中原样保留。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// 暂时性错误（限流、配额、网络抖动、5xx），可退避重试
    #[error("{0}")]
    Transient(String),

    /// 永久性错误（鉴权、参数非法、角色不存在），不重试
    #[error("{0}")]
    Permanent(String),

    /// 调用方未能分类的错误，由 RecoveryEngine 按已知签名判断
    #[error("{0}")]
    Unknown(String),

    /// 调用名义成功但返回为空
    #[error("Invalid response from model call - None or empty")]
    EmptyResponse,

    /// 单次调用超时
    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),
}

/// 错误类别（用于日志与统计）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorKind {
    Transient,
    Permanent,
    Unknown,
}

impl CallError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    pub fn kind(&self) -> CallErrorKind {
        match self {
            CallError::Transient(_) | CallError::EmptyResponse | CallError::Timeout(_) => {
                CallErrorKind::Transient
            }
            CallError::Permanent(_) => CallErrorKind::Permanent,
            CallError::Unknown(_) => CallErrorKind::Unknown,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待给定时长后在同一模型上重试
    Retry(Duration),
    /// 当前模型重试次数耗尽，切换到下一个备用模型
    DowngradeModel,
    /// 放弃该步骤，错误作为步骤失败上报
    Abort,
}
