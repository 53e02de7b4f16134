// SSH 客户端核心实现
// 负责 TCP 连接、SSH 握手与认证，产出已认证的 Transport

use std::net::{Shutdown, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use russh::client::{AuthResult, Handle, Msg};
use russh::{Channel, Disconnect};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::credentials::AuthDescriptor;
use super::error::SshError;
use super::event::{ConnectionStage, LogEntry, SessionEvent};
use super::handler::{SshClientHandler, VerdictSlot};
use super::known_hosts::{HostKeyVerdict, KnownHosts};
use super::registry::SessionId;

/// 已认证的 SSH 传输层
///
/// 内部的 russh Handle 支持在同一连接上并发打开多个通道
pub struct Transport {
    handle: Handle<SshClientHandler>,
    address: String,
}

impl Transport {
    fn new(handle: Handle<SshClientHandler>, address: String) -> Self {
        Self { handle, address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 底层连接是否已经断开
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// 打开一个新的 session 通道
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        if self.is_closed() {
            return Err(SshError::ChannelClosed);
        }
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelRequestRejected(format!("open session channel: {}", e)))
    }

    /// 主动断开连接
    pub async fn disconnect(&self) -> Result<(), SshError> {
        if self.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
            .map_err(SshError::from)
    }
}

/// SSH 客户端
/// 负责建立 SSH 连接并返回 Transport
pub struct SshClient {
    /// 连接配置
    config: SshConfig,
    known_hosts: Arc<KnownHosts>,
    /// 事件发送器
    event_sender: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SshClient {
    pub fn new(
        config: SshConfig,
        known_hosts: Arc<KnownHosts>,
        event_sender: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> Self {
        Self {
            config,
            known_hosts,
            event_sender,
        }
    }

    fn emit_stage(&self, session_id: &SessionId, stage: ConnectionStage) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(SessionEvent::Stage {
                session_id: session_id.clone(),
                stage,
            });
        }
    }

    fn log(&self, session_id: &SessionId, entry: LogEntry) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(SessionEvent::Log {
                session_id: session_id.clone(),
                entry,
            });
        }
    }

    /// 执行连接
    ///
    /// 超时或取消时，部分建立的 TCP 连接会在返回前被关闭
    pub async fn connect(
        &self,
        session_id: &SessionId,
        auth: &AuthDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Transport, SshError> {
        let connect_timeout = self.config.connect_timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("[SSH] Connection to {} cancelled", self.config.address());
                self.log(session_id, LogEntry::warn("Connection cancelled"));
                Err(SshError::Cancelled)
            }
            result = timeout(connect_timeout, self.establish(session_id, auth)) => match result {
                Ok(result) => result,
                Err(_) => {
                    self.log(session_id, LogEntry::error("Connection timed out"));
                    Err(SshError::NetworkUnreachable(format!(
                        "connection to {} timed out after {}s",
                        self.config.address(),
                        connect_timeout.as_secs()
                    )))
                }
            },
        }
    }

    async fn establish(
        &self,
        session_id: &SessionId,
        auth: &AuthDescriptor,
    ) -> Result<Transport, SshError> {
        let address = self.config.address();

        // 阶段 1: 初始化
        self.emit_stage(session_id, ConnectionStage::Initializing);
        self.log(
            session_id,
            LogEntry::debug(format!("Target: {}@{}", auth.username, address)),
        );

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address.as_str())
            .await
            .map_err(|e| SshError::NetworkUnreachable(format!("failed to resolve {}: {}", address, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(SshError::NetworkUnreachable(format!(
                "no address found for {}",
                address
            )));
        }

        // 阶段 2: TCP 连接
        self.emit_stage(session_id, ConnectionStage::ConnectingHost);
        let stream = connect_any(&addrs).await?;
        let (stream, mut guard) = SocketGuard::wrap(stream)?;
        let _ = stream.set_nodelay(true);
        self.log(session_id, LogEntry::info("TCP connection established"));

        // 阶段 3: SSH 握手
        self.emit_stage(session_id, ConnectionStage::Handshaking);
        let (handler, verdict) = SshClientHandler::new(
            &self.config.host,
            self.config.port,
            self.config.host_key_policy,
            self.known_hosts.clone(),
            self.event_sender.clone(),
        );
        let russh_config = Arc::new(self.config.to_russh_config());
        let mut handle = match russh::client::connect_stream(russh_config, stream, handler).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.handshake_error(e, &verdict)),
        };
        self.log(session_id, LogEntry::info("SSH handshake completed"));

        // 阶段 4: 认证
        self.emit_stage(session_id, ConnectionStage::Authenticating);
        self.authenticate(session_id, &mut handle, auth).await?;
        self.log(session_id, LogEntry::info("Authentication successful"));

        guard.disarm();
        self.emit_stage(session_id, ConnectionStage::Connected);
        info!("[SSH] Connected to {} as {}", address, auth.username);

        Ok(Transport::new(handle, address))
    }

    fn handshake_error(&self, error: russh::Error, verdict: &VerdictSlot) -> SshError {
        let verdict = verdict.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match verdict {
            Some(HostKeyVerdict::Mismatch { expected }) => SshError::HostKeyRejected {
                host: self.config.address(),
                reason: format!("host key changed (expected {})", expected),
            },
            Some(HostKeyVerdict::Unknown) => SshError::HostKeyRejected {
                host: self.config.address(),
                reason: "unknown host key under strict checking".to_string(),
            },
            _ => SshError::ProtocolError(format!("handshake failed: {}", error)),
        }
    }

    /// 执行认证
    async fn authenticate(
        &self,
        session_id: &SessionId,
        handle: &mut Handle<SshClientHandler>,
        auth: &AuthDescriptor,
    ) -> Result<(), SshError> {
        let result = match &auth.method {
            AuthMethod::Password(password) => {
                self.log(session_id, LogEntry::debug("Using password authentication"));
                handle
                    .authenticate_password(&auth.username, password)
                    .await
                    .map_err(SshError::from)?
            }
            AuthMethod::PublicKey {
                key_path,
                passphrase,
            } => {
                self.log(
                    session_id,
                    LogEntry::debug(format!("Using public key authentication: {:?}", key_path)),
                );
                let key = load_private_key(key_path, passphrase.as_deref()).await?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(SshError::from)?
                    .flatten();
                let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
                handle
                    .authenticate_publickey(&auth.username, key_with_alg)
                    .await
                    .map_err(SshError::from)?
            }
        };

        match result {
            AuthResult::Success => Ok(()),
            AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => {
                if partial_success {
                    return Err(SshError::AuthenticationFailed(
                        "partial authentication - additional auth required".to_string(),
                    ));
                }
                Err(SshError::AuthenticationFailed(format!(
                    "server rejected credentials for '{}' (remaining methods: {:?})",
                    auth.username, remaining_methods
                )))
            }
        }
    }
}

/// 依次尝试解析出的地址
async fn connect_any(addrs: &[SocketAddr]) -> Result<TcpStream, SshError> {
    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("[SSH] TCP connect to {} failed: {}", addr, e);
                last_error = Some(format!("{}: {}", addr, e));
            }
        }
    }
    Err(SshError::NetworkUnreachable(
        last_error.unwrap_or_else(|| "no address to connect to".to_string()),
    ))
}

/// 加载私钥文件
async fn load_private_key(
    key_path: &Path,
    passphrase: Option<&str>,
) -> Result<russh::keys::PrivateKey, SshError> {
    let key_data = tokio::fs::read_to_string(key_path)
        .await
        .map_err(|e| SshError::KeyFile(format!("failed to read {}: {}", key_path.display(), e)))?;

    russh::keys::decode_secret_key(&key_data, passphrase)
        .map_err(|e| SshError::KeyFile(format!("failed to decode {}: {}", key_path.display(), e)))
}

/// 持有 socket 的副本，未成功建立连接时在 drop 中关闭 TCP 连接
struct SocketGuard {
    socket: Option<std::net::TcpStream>,
}

impl SocketGuard {
    fn wrap(stream: TcpStream) -> Result<(TcpStream, Self), SshError> {
        let std_stream = stream
            .into_std()
            .map_err(|e| SshError::NetworkUnreachable(e.to_string()))?;
        let duplicate = std_stream
            .try_clone()
            .map_err(|e| SshError::NetworkUnreachable(e.to_string()))?;
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| SshError::NetworkUnreachable(e.to_string()))?;
        Ok((
            stream,
            Self {
                socket: Some(duplicate),
            },
        ))
    }

    fn disarm(&mut self) {
        self.socket = None;
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!("[SSH] Shutting down unfinished TCP connection");
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}
