//! 推送通道重连策略
//!
//! 默认保持固定间隔（每次失败只安排一次重连，不设上限）；
//! 需要防重连风暴时可以切换为带抖动的指数退避。

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// 固定间隔
    Fixed { delay_ms: u64 },
    /// 指数退避：initial * multiplier^attempt，封顶 max，再叠加 ±jitter 比例的随机抖动
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
        jitter: f64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed { delay_ms: 5_000 }
    }
}

impl ReconnectPolicy {
    /// 毫秒数超出 u64 时取 u64::MAX
    pub fn fixed(delay: Duration) -> Self {
        ReconnectPolicy::Fixed {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// 1s → 2s → 4s … 封顶 60s，±20% 抖动
    pub fn exponential() -> Self {
        ReconnectPolicy::Exponential {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// 第 `attempt` 次重连前的等待时间（attempt 从 0 开始，连接成功后归零）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            ReconnectPolicy::Exponential {
                initial_ms,
                max_ms,
                multiplier,
                jitter,
            } => {
                let base = initial_ms as f64 * multiplier.max(1.0).powi(attempt.min(32) as i32);
                let capped = base.min(max_ms as f64);
                let spread = capped * jitter.clamp(0.0, 1.0) * (rand::random::<f64>() * 2.0 - 1.0);
                Duration::from_millis((capped + spread).max(0.0) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_never_grows() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1_000), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_saturates_oversized_delay() {
        assert_eq!(
            ReconnectPolicy::fixed(Duration::from_millis(2_500)),
            ReconnectPolicy::Fixed { delay_ms: 2_500 }
        );
        assert_eq!(
            ReconnectPolicy::fixed(Duration::MAX),
            ReconnectPolicy::Fixed { delay_ms: u64::MAX }
        );
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = ReconnectPolicy::Exponential {
            initial_ms: 1_000,
            max_ms: 8_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
    }

    #[test]
    fn test_exponential_jitter_stays_in_band() {
        let policy = ReconnectPolicy::exponential();
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_millis() as u64;
            assert!((1_600..=2_400).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn test_policy_config_format() {
        let json = serde_json::to_string(&ReconnectPolicy::default()).unwrap();
        assert_eq!(json, r#"{"kind":"fixed","delay_ms":5000}"#);
    }
}
