// SSH 重连策略
//
// 重连只对 Failed 会话进行，每次尝试都是一次全新的连接

use std::time::Duration;

use crate::models::ConnectionSettings;

/// 重连策略（指数退避，封顶）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 第一次失败后的等待时间
    pub initial_delay: Duration,
    /// 等待时间上限
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&ConnectionSettings::default())
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        let initial_delay = Duration::from_secs(settings.reconnect_interval_secs as u64);
        Self {
            max_attempts: settings.reconnect_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(settings.reconnect_max_interval_secs as u64)
                .max(initial_delay),
        }
    }

    /// 第 `attempt` 次失败后、下一次尝试前的等待时间（attempt 从 1 开始）
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}
