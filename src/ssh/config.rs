// SSH 连接配置

use std::path::PathBuf;
use std::time::Duration;

use crate::models::ConnectionSettings;

/// SSH 连接配置
#[derive(Clone, Debug)]
pub struct SshConfig {
    /// 目标主机
    pub host: String,
    /// 端口
    pub port: u16,
    /// 连接超时（TCP + 握手 + 认证）
    pub connect_timeout: Duration,
    /// 心跳配置
    pub keepalive: KeepaliveConfig,
    /// 主机密钥校验策略
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            connect_timeout: Duration::from_secs(30),
            keepalive: KeepaliveConfig::default(),
            host_key_policy: HostKeyPolicy::AcceptNew,
        }
    }
}

/// 认证方式
#[derive(Clone)]
pub enum AuthMethod {
    /// 密码认证
    Password(String),
    /// 公钥认证
    PublicKey {
        /// 私钥文件路径
        key_path: PathBuf,
        /// 私钥密码（如果有）
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PublicKey { key_path, passphrase } => f
                .debug_struct("PublicKey")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// 主机密钥校验策略
///
/// 未知主机的处理方式必须显式选择
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// 首次连接时记录密钥（TOFU），之后必须一致
    AcceptNew,
    /// 只接受已记录的密钥
    Strict,
}

/// 心跳配置
#[derive(Clone, Debug)]
pub struct KeepaliveConfig {
    /// 是否启用心跳
    pub enabled: bool,
    /// 心跳间隔
    pub interval: Duration,
    /// 最大无响应次数
    pub max_retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

impl SshConfig {
    /// 根据设置为指定主机构建配置
    pub fn from_settings(host: &str, port: u16, settings: &ConnectionSettings) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout: settings.connect_timeout(),
            keepalive: KeepaliveConfig {
                enabled: settings.keepalive_interval_secs > 0,
                interval: Duration::from_secs(settings.keepalive_interval_secs as u64),
                max_retries: settings.keepalive_max,
            },
            host_key_policy: if settings.strict_host_key_checking {
                HostKeyPolicy::Strict
            } else {
                HostKeyPolicy::AcceptNew
            },
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 构建 russh 配置
    pub fn to_russh_config(&self) -> russh::client::Config {
        let mut config = russh::client::Config::default();
        // 空闲连接靠心跳维持，不设置不活动超时
        config.inactivity_timeout = None;
        if self.keepalive.enabled {
            config.keepalive_interval = Some(self.keepalive.interval);
            config.keepalive_max = self.keepalive.max_retries as usize;
        }
        config
    }
}
