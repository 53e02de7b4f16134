// SSH 错误类型定义

use thiserror::Error;

use super::event::SessionState;

/// SSH 会话核心错误类型
#[derive(Debug, Error)]
pub enum SshError {
    /// 凭据配置错误（认证方式与凭据不一致、用户名为空）
    #[error("Invalid credential configuration: {0}")]
    InvalidCredentialConfig(String),

    /// 网络不可达（解析失败、连接被拒绝、连接超时）
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// 认证失败
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// 主机密钥被拒绝
    #[error("Host key rejected for {host}: {reason}")]
    HostKeyRejected { host: String, reason: String },

    /// SSH 协议错误
    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    /// 私钥文件读取或解析失败
    #[error("Key file error: {0}")]
    KeyFile(String),

    /// 命令执行超时
    #[error("Command timed out after {0:?}")]
    CommandTimedOut(std::time::Duration),

    /// 会话未连接（已失败或已关闭）
    #[error("Session {0} is not connected")]
    SessionNotConnected(String),

    /// 会话已存在活跃的 Shell 通道
    #[error("Session {0} already has an active shell")]
    ShellAlreadyActive(String),

    /// 远端拒绝通道请求（PTY / shell / exec）
    #[error("Channel request rejected: {0}")]
    ChannelRequestRejected(String),

    /// 通道已关闭
    #[error("Channel closed")]
    ChannelClosed,

    /// 操作进行中传输层断开
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// 未知会话 ID
    #[error("Session not found: {0}")]
    NotFound(String),

    /// 重连只允许在 Failed 状态下进行
    #[error("Session {id} cannot be reconnected from state {state:?}")]
    ReconnectRefused { id: String, state: SessionState },

    /// 操作已被调用方取消
    #[error("Operation cancelled")]
    Cancelled,
}

impl SshError {
    /// 网络层错误（主机不可达），UI 应提示检查网络
    pub fn is_network(&self) -> bool {
        matches!(self, SshError::NetworkUnreachable(_))
    }

    /// 凭据层错误，UI 应提示修改密码或密钥
    pub fn is_credential(&self) -> bool {
        matches!(
            self,
            SshError::AuthenticationFailed(_)
                | SshError::InvalidCredentialConfig(_)
                | SshError::KeyFile(_)
        )
    }

    /// 重连时是否值得再次尝试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::NetworkUnreachable(_)
                | SshError::ProtocolError(_)
                | SshError::ConnectionLost(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::ProtocolError(e.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(e: russh::keys::Error) -> Self {
        SshError::KeyFile(e.to_string())
    }
}
