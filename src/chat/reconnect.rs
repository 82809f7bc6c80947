//! 断线重连退避策略

use std::time::Duration;

/// 指数退避：`delay = min(2^attempts * base, cap)`，最多 `max_attempts` 次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// 已重试 `attempts` 次后的下一次等待时长
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// 还能重试时返回等待时长，次数用尽返回 `None`
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts < self.max_attempts {
            Some(self.delay_for(attempts))
        } else {
            None
        }
    }
}
