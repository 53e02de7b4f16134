// SSH 会话核心
//
// 模块结构:
// - config: 连接配置 (SshConfig, AuthMethod, HostKeyPolicy)
// - credentials: 凭据解析 (ServerProfile -> AuthDescriptor)
// - error: 错误类型 (SshError)
// - event: 会话事件 (SessionEvent, SessionState, ConnectionStage, LogEntry)
// - known_hosts: 主机密钥校验
// - handler: russh Handler 实现
// - client: 建立连接，产出 Transport
// - exec: 单条命令执行
// - shell: 交互式 Shell 通道
// - session / registry: 会话对象与注册表
// - reconnect: 重连退避策略
// - supervisor: 会话生命周期的统一入口

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod exec;
pub mod handler;
pub mod known_hosts;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod shell;
pub mod supervisor;

// 公开导出
pub use client::{SshClient, Transport};
pub use config::{AuthMethod, HostKeyPolicy, KeepaliveConfig, SshConfig};
pub use credentials::AuthDescriptor;
pub use error::SshError;
pub use event::{ConnectionStage, LogEntry, LogLevel, SessionEvent, SessionState};
pub use exec::CommandOutput;
pub use known_hosts::{HostKeyVerdict, KnownHosts};
pub use reconnect::ReconnectPolicy;
pub use registry::{SessionId, SessionRegistry};
pub use session::{Session, SessionInfo};
pub use shell::{PendingOutput, PtyRequest, ShellAck, ShellChannel, ShellState};
pub use supervisor::SessionSupervisor;
