// 连接设置

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 应用设置（settings.json）
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    pub connection: ConnectionSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    // SSH
    pub connection_timeout_secs: u32,
    pub keepalive_interval_secs: u32,
    pub keepalive_max: u32,
    pub strict_host_key_checking: bool,
    pub term: String,
    // 命令执行
    pub command_timeout_secs: u32,
    // 存活检测
    pub liveness_interval_secs: u32,
    pub liveness_timeout_secs: u32,
    pub liveness_command: String,
    // 自动重连
    pub reconnect_attempts: u32,
    pub reconnect_interval_secs: u32,
    pub reconnect_max_interval_secs: u32,
    // Shell 输出缓冲上限（字节）
    pub pending_output_limit: usize,
    pub teardown_timeout_secs: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            keepalive_interval_secs: 60,
            keepalive_max: 3,
            strict_host_key_checking: false,
            term: "xterm-256color".to_string(),
            command_timeout_secs: 30,
            liveness_interval_secs: 30,
            liveness_timeout_secs: 10,
            liveness_command: "true".to_string(),
            reconnect_attempts: 3,
            reconnect_interval_secs: 5,
            reconnect_max_interval_secs: 60,
            pending_output_limit: 1024 * 1024,
            teardown_timeout_secs: 5,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs as u64)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs as u64)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1) as u64)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs.max(1) as u64)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: AppSettings =
            serde_json::from_str(r#"{ "connection": { "reconnect_attempts": 7 } }"#).unwrap();
        assert_eq!(settings.connection.reconnect_attempts, 7);
        assert_eq!(settings.connection.connection_timeout_secs, 30);
        assert_eq!(settings.connection.term, "xterm-256color");
    }

    #[test]
    fn zero_liveness_interval_is_clamped() {
        let settings = ConnectionSettings {
            liveness_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.liveness_interval(), Duration::from_secs(1));
    }
}
