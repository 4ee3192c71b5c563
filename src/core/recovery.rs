//! 错误恢复引擎
//!
//! 根据 CallError 类别与当前尝试次数返回 RecoveryAction，供 Dispatcher 决定是重试、换模型还是放弃。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::{CallError, RecoveryAction};
use crate::llm::RetryPolicy;

/// 未分类错误中视为暂时性故障的已知签名
const TRANSIENT_SIGNATURES: &str = r"(?i)rate.?limit|quota|timed?.?out|\b(429|500|502|503|504)\b|none or empty|invalid response|connection|overloaded";

fn transient_signatures() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(TRANSIENT_SIGNATURES).expect("transient signature pattern is valid"))
}

/// 语义化错误恢复：将错误映射为可执行动作（退避重试 / 换模型 / 终止）
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 是否可重试：Transient 直接重试，Permanent 从不重试，Unknown 回落到签名匹配
    pub fn is_retryable(&self, err: &CallError) -> bool {
        match err {
            CallError::Transient(_) | CallError::EmptyResponse | CallError::Timeout(_) => true,
            CallError::Permanent(_) => false,
            CallError::Unknown(msg) => transient_signatures().is_match(msg),
        }
    }

    /// attempt 为刚失败的尝试序号（从 0 开始）；has_fallback 表示还有备用模型可切换
    pub fn handle(&self, err: &CallError, attempt: u32, has_fallback: bool) -> RecoveryAction {
        if !self.is_retryable(err) {
            return RecoveryAction::Abort;
        }
        if attempt + 1 < self.policy.attempts_per_model() {
            RecoveryAction::Retry(self.policy.delay_for(attempt))
        } else if has_fallback {
            RecoveryAction::DowngradeModel
        } else {
            RecoveryAction::Abort
        }
    }
}
