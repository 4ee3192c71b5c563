//! 重试策略：每个模型的最大尝试次数与指数退避（带抖动）

use std::time::Duration;

use rand::Rng;

/// 指数退避配置：第 n 次失败后等待 `initial_backoff * multiplier^n`，再叠加 0~jitter_ratio 的随机抖动
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 单个模型最多尝试次数（含首次）
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    /// 抖动上限占基础退避的比例（0.1 即 0~10%）
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn attempts_per_model(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// 不含抖动的基础退避；multiplier 小于 1 时按 1 处理，保证随 attempt 单调不减
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// 基础退避加随机抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let ratio = self.jitter_ratio.max(0.0);
        if ratio == 0.0 || base.is_zero() {
            return base;
        }
        let jitter = rand::rng().random_range(0.0..=ratio);
        base.saturating_add(base.mul_f64(jitter))
    }
}
