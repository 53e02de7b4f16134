// SSH 会话事件定义

use chrono::{DateTime, Local};
use serde::Serialize;

use super::registry::SessionId;

/// 会话状态
///
/// `Connecting → Authenticated → ShellActive → Closing → Closed`，
/// `Failed` 为终态，可从 Connecting / Authenticated / ShellActive 到达
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Connecting,
    Authenticated,
    ShellActive,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// 会话是否还能承载命令和 Shell
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Authenticated | Self::ShellActive)
    }

    /// 状态转换是否合法
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Authenticated) | (Connecting, Failed) => true,
            (Authenticated, ShellActive) | (Authenticated, Failed) => true,
            (ShellActive, Authenticated) | (ShellActive, Failed) => true,
            (Authenticated | ShellActive | Failed, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::ShellActive => "shell_active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// 会话事件（推送给 UI）
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// 会话状态变化
    StateChanged {
        session_id: SessionId,
        server_id: String,
        state: SessionState,
    },
    /// 连接阶段变化
    Stage {
        session_id: SessionId,
        stage: ConnectionStage,
    },
    /// 连接日志
    Log {
        session_id: SessionId,
        entry: LogEntry,
    },
    /// 首次连接时记录了新的主机密钥
    HostKeyLearned {
        host: String,
        port: u16,
        key_type: String,
        fingerprint: String,
    },
    /// 正在重连
    Reconnecting {
        previous: SessionId,
        attempt: u32,
        max_attempts: u32,
    },
    /// 重连成功，新会话取代旧会话
    Reconnected {
        previous: SessionId,
        session_id: SessionId,
    },
    /// 非致命警告（例如 resize 失败）
    Warning {
        session_id: SessionId,
        message: String,
    },
}

/// 连接阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionStage {
    /// 初始化（解析配置、准备连接）
    Initializing = 0,
    /// TCP 连接目标主机
    ConnectingHost = 1,
    /// SSH 握手（密钥交换）
    Handshaking = 2,
    /// 身份认证
    Authenticating = 3,
    /// 连接完成
    Connected = 4,
}

impl ConnectionStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::ConnectingHost => "Connecting to host",
            Self::Handshaking => "SSH handshake",
            Self::Authenticating => "Authenticating",
            Self::Connected => "Connected",
        }
    }

    /// 获取进度百分比 (0.0 - 1.0)
    pub fn progress(&self) -> f32 {
        match self {
            Self::Initializing => 0.0,
            Self::ConnectingHost => 0.25,
            Self::Handshaking => 0.5,
            Self::Authenticating => 0.75,
            Self::Connected => 1.0,
        }
    }
}

/// 日志级别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// 日志条目
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}
