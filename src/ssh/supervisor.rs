// 会话监管
// 连接、命令、Shell、存活检测、重连与拆除的统一入口
//
// 所有会话状态转换都经由这里完成

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{ConnectionSettings, ServerProfile};

use super::client::SshClient;
use super::config::SshConfig;
use super::credentials;
use super::error::SshError;
use super::event::{SessionEvent, SessionState};
use super::exec::{self, CommandOutput};
use super::known_hosts::KnownHosts;
use super::reconnect::ReconnectPolicy;
use super::registry::{SessionId, SessionRegistry};
use super::session::{Session, SessionInfo, ShellSlot};
use super::shell::{PtyRequest, ShellAck, ShellChannel};

/// 会话监管器
pub struct SessionSupervisor {
    registry: Arc<SessionRegistry>,
    known_hosts: Arc<KnownHosts>,
    settings: ConnectionSettings,
    reconnect_policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionSupervisor {
    /// 创建监管器，返回事件接收端
    pub fn new(
        registry: Arc<SessionRegistry>,
        known_hosts: Arc<KnownHosts>,
        settings: ConnectionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let reconnect_policy = ReconnectPolicy::from_settings(&settings);
        (
            Self {
                registry,
                known_hosts,
                settings,
                reconnect_policy,
                events,
            },
            event_rx,
        )
    }

    /// 覆盖重连策略
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn emit(&self, event: SessionEvent) {
        // 接收端被丢弃时事件直接作废
        let _ = self.events.send(event);
    }

    fn emit_state(&self, session_id: &SessionId, server_id: &str, state: SessionState) {
        self.emit(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            server_id: server_id.to_string(),
            state,
        });
    }

    fn transition(&self, session: &Session, state: SessionState) -> bool {
        let changed = session.set_state(state);
        if changed {
            self.emit_state(session.id(), session.server_id(), state);
        }
        changed
    }

    fn mark_failed(&self, session: &Session, reason: &str) {
        if self.transition(session, SessionState::Failed) {
            warn!("[Supervisor] Session {} failed: {}", session.id(), reason);
        }
    }

    /// 连接服务器并注册会话
    pub async fn connect_session(&self, profile: &ServerProfile) -> Result<SessionId, SshError> {
        self.connect_session_with_cancel(profile, &CancellationToken::new())
            .await
    }

    /// 可取消的连接
    ///
    /// 只有认证成功的连接才会被注册；失败或取消时不留下任何会话
    pub async fn connect_session_with_cancel(
        &self,
        profile: &ServerProfile,
        cancel: &CancellationToken,
    ) -> Result<SessionId, SshError> {
        let session_id = self.registry.next_id();
        self.emit_state(&session_id, &profile.id, SessionState::Connecting);
        info!(
            "[Supervisor] Connecting {} to {}",
            session_id,
            profile.label()
        );

        let result = async {
            let auth = credentials::resolve(profile)?;
            let config = SshConfig::from_settings(&profile.host, profile.port, &self.settings);
            let client = SshClient::new(config, self.known_hosts.clone(), Some(self.events.clone()));
            let transport = client.connect(&session_id, &auth, cancel).await?;
            Ok::<_, SshError>((auth, transport))
        }
        .await;

        match result {
            Ok((auth, transport)) => {
                let session = Session::new(
                    session_id.clone(),
                    profile.id.clone(),
                    profile.host.clone(),
                    auth.username,
                    transport,
                );
                session.set_state(SessionState::Authenticated);
                let id = self.registry.create(session);
                self.emit_state(&id, &profile.id, SessionState::Authenticated);
                info!("[Supervisor] Session {} authenticated", id);
                Ok(id)
            }
            Err(e) => {
                warn!(
                    "[Supervisor] Connection to {} failed: {}",
                    profile.label(),
                    e
                );
                self.emit_state(&session_id, &profile.id, SessionState::Failed);
                Err(e)
            }
        }
    }

    /// 执行一条命令
    pub async fn run_command(
        &self,
        session_id: &SessionId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SshError> {
        self.run_command_with_cancel(session_id, command, timeout, &CancellationToken::new())
            .await
    }

    pub async fn run_command_with_cancel(
        &self,
        session_id: &SessionId,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SshError> {
        let session = self.registry.get(session_id)?;
        let result = exec::run(&session, command, timeout, cancel).await;
        if let Err(e) = &result {
            self.note_transport_error(&session, e);
        }
        result
    }

    /// 命令或通道失败后，如果底层连接已经断开则标记会话失败
    fn note_transport_error(&self, session: &Session, error: &SshError) {
        let lost = matches!(error, SshError::ConnectionLost(_)) || session.transport().is_closed();
        if lost && session.state().is_usable() {
            self.mark_failed(session, &error.to_string());
        }
    }

    /// 打开交互式 Shell
    ///
    /// 打开期间槽位处于 Opening，其它 Shell 操作不会被阻塞；
    /// `close_shell` 与拆除会中止进行中的打开
    pub async fn open_shell(
        &self,
        session_id: &SessionId,
        cols: u32,
        rows: u32,
    ) -> Result<ShellAck, SshError> {
        let session = self.registry.get(session_id)?;
        if !session.state().is_usable() {
            return Err(SshError::SessionNotConnected(session_id.to_string()));
        }

        let cancel = CancellationToken::new();
        let stale = {
            let mut slot = session.shell_slot();
            if slot.is_busy() {
                return Err(SshError::ShellAlreadyActive(session_id.to_string()));
            }
            let stale = slot.clear();
            *slot = ShellSlot::Opening(cancel.clone());
            stale
        };
        if let Some(stale) = stale {
            // 远端已退出的旧 Shell
            self.settle_closed_shell(&session, &stale);
            if !session.state().is_usable() {
                session.shell_slot().clear();
                return Err(SshError::SessionNotConnected(session_id.to_string()));
            }
        }

        let pty = PtyRequest::new(self.settings.term.clone(), cols, rows);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SshError::Cancelled),
            opened = tokio::time::timeout(
                self.settings.connect_timeout(),
                ShellChannel::open(
                    session_id.as_str(),
                    session.transport(),
                    pty,
                    self.settings.pending_output_limit,
                    session.activity_clock(),
                ),
            ) => opened.unwrap_or_else(|_| {
                Err(SshError::ChannelRequestRejected(
                    "timed out waiting for shell".to_string(),
                ))
            }),
        };

        let opened = match opened {
            Ok(shell) => {
                let shell = Arc::new(shell);
                let installed = {
                    let mut slot = session.shell_slot();
                    // 打开期间被关闭或拆除时槽位已被清空
                    if cancel.is_cancelled() {
                        false
                    } else {
                        *slot = ShellSlot::Open(shell.clone());
                        true
                    }
                };
                if installed {
                    Ok(shell)
                } else {
                    shell.close(self.settings.teardown_timeout()).await;
                    Err(SshError::Cancelled)
                }
            }
            Err(e) => {
                let mut slot = session.shell_slot();
                if !cancel.is_cancelled() {
                    *slot = ShellSlot::Empty;
                }
                Err(e)
            }
        };

        match opened {
            Ok(shell) => {
                self.transition(&session, SessionState::ShellActive);
                self.watch_shell(&session, &shell);
                Ok(ShellAck::ok())
            }
            Err(SshError::Cancelled) => {
                debug!("[Supervisor] Opening shell on {} was cancelled", session_id);
                Err(SshError::Cancelled)
            }
            Err(e) => {
                warn!("[Supervisor] Failed to open shell on {}: {}", session_id, e);
                self.note_transport_error(&session, &e);
                Err(e)
            }
        }
    }

    /// Shell 后台任务退出后，如果是连接断开则立即标记会话失败
    ///
    /// 远端正常退出时保持 ShellActive，直到剩余输出被读完
    fn watch_shell(&self, session: &Arc<Session>, shell: &Arc<ShellChannel>) {
        let finished = shell.finished();
        let shell = Arc::downgrade(shell);
        let session = session.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            finished.cancelled().await;
            let lost = shell.upgrade().is_some_and(|shell| shell.connection_lost());
            if !(lost || session.transport().is_closed()) || !session.state().is_usable() {
                return;
            }
            if session.set_state(SessionState::Failed) {
                warn!(
                    "[Supervisor] Session {} failed: connection lost while shell was open",
                    session.id()
                );
                let _ = events.send(SessionEvent::StateChanged {
                    session_id: session.id().clone(),
                    server_id: session.server_id().to_string(),
                    state: SessionState::Failed,
                });
            }
        });
    }

    /// 已结束的 Shell 被移出槽位后更新会话状态
    fn settle_closed_shell(&self, session: &Session, shell: &ShellChannel) {
        info!(
            "[Supervisor] Shell of {} exited (status {:?})",
            session.id(),
            shell.exit_status()
        );
        if shell.connection_lost() || session.transport().is_closed() {
            self.mark_failed(session, "connection lost");
        } else {
            self.transition(session, SessionState::Authenticated);
        }
    }

    /// 获取会话当前的 Shell；远端已关闭且输出已读完的 Shell 在此处回收
    fn current_shell(&self, session: &Session) -> Option<Arc<ShellChannel>> {
        let shell = match &*session.shell_slot() {
            ShellSlot::Open(shell) => shell.clone(),
            ShellSlot::Empty | ShellSlot::Opening(_) => return None,
        };
        if shell.is_closed() && shell.pending_len() == 0 {
            let reclaimed = {
                let mut slot = session.shell_slot();
                match &*slot {
                    ShellSlot::Open(current) if Arc::ptr_eq(current, &shell) => {
                        *slot = ShellSlot::Empty;
                        true
                    }
                    _ => false,
                }
            };
            if reclaimed {
                self.settle_closed_shell(session, &shell);
            }
            // 仍返回以便调用方拿到 ChannelClosed
        }
        Some(shell)
    }

    /// 向 Shell 写入数据
    pub async fn write_shell(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SshError> {
        let session = self.registry.get(session_id)?;
        let shell = self.current_shell(&session).ok_or(SshError::ChannelClosed)?;
        shell.write(data)
    }

    /// 读取自上次读取以来的 Shell 输出，无数据时返回空
    pub async fn read_shell(&self, session_id: &SessionId) -> Result<Vec<u8>, SshError> {
        let session = self.registry.get(session_id)?;
        match self.current_shell(&session) {
            Some(shell) => Ok(shell.read()),
            None => Ok(Vec::new()),
        }
    }

    /// 订阅 Shell 输出流
    pub async fn subscribe_shell(
        &self,
        session_id: &SessionId,
    ) -> Result<BoxStream<'static, Vec<u8>>, SshError> {
        let session = self.registry.get(session_id)?;
        let shell = self.current_shell(&session).ok_or(SshError::ChannelClosed)?;
        if shell.is_closed() {
            return Err(SshError::ChannelClosed);
        }
        Ok(shell.subscribe())
    }

    /// 调整 Shell 尺寸（尽力而为，失败只返回警告）
    pub async fn resize_shell(&self, session_id: &SessionId, cols: u32, rows: u32) -> ShellAck {
        let ack = match self.registry.get(session_id) {
            Ok(session) => match self.current_shell(&session) {
                Some(shell) => shell.resize(cols, rows).await,
                None => ShellAck::warn("no shell open, resize ignored"),
            },
            Err(e) => ShellAck::warn(e.to_string()),
        };
        if let Some(message) = &ack.warning {
            debug!("[Supervisor] Resize on {}: {}", session_id, message);
            self.emit(SessionEvent::Warning {
                session_id: session_id.clone(),
                message: message.clone(),
            });
        }
        ack
    }

    /// 关闭 Shell，可重复调用
    pub async fn close_shell(&self, session_id: &SessionId) -> Result<(), SshError> {
        let session = self.registry.get(session_id)?;
        let shell = session.shell_slot().clear();
        if let Some(shell) = shell {
            shell.close(self.settings.teardown_timeout()).await;
            if shell.connection_lost() || session.transport().is_closed() {
                self.mark_failed(&session, "connection lost");
            } else {
                self.transition(&session, SessionState::Authenticated);
            }
        }
        Ok(())
    }

    /// 拆除会话：关闭 Shell、断开连接、从注册表移除
    ///
    /// 每一步都会执行，错误只记录日志。第二次调用返回 `NotFound`
    pub async fn teardown_session(&self, session_id: &SessionId) -> Result<(), SshError> {
        let session = self.registry.get(session_id)?;
        if !session.begin_closing() {
            return Err(SshError::NotFound(session_id.to_string()));
        }
        self.emit_state(session_id, session.server_id(), SessionState::Closing);
        info!("[Supervisor] Tearing down session {}", session_id);

        let teardown_timeout = self.settings.teardown_timeout();

        // 1. Shell（进行中的打开也一并中止）
        let shell = session.shell_slot().clear();
        if let Some(shell) = shell {
            shell.close(teardown_timeout).await;
        }

        // 2. 连接
        match tokio::time::timeout(teardown_timeout, session.transport().disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[Supervisor] Disconnect of {} failed: {}", session_id, e),
            Err(_) => warn!("[Supervisor] Disconnect of {} timed out", session_id),
        }

        // 3. 注册表
        self.registry.remove(session_id);
        session.set_state(SessionState::Closed);
        self.emit_state(session_id, session.server_id(), SessionState::Closed);
        info!("[Supervisor] Session {} closed", session_id);
        Ok(())
    }

    /// 存活检测，返回会话是否仍然可用
    pub async fn check_liveness(&self, session_id: &SessionId) -> Result<bool, SshError> {
        self.check_liveness_with_cancel(session_id, &CancellationToken::new())
            .await
    }

    /// 可取消的存活检测，取消不会改变会话或 Shell 状态
    pub async fn check_liveness_with_cancel(
        &self,
        session_id: &SessionId,
        cancel: &CancellationToken,
    ) -> Result<bool, SshError> {
        let session = self.registry.get(session_id)?;
        if !session.state().is_usable() {
            return Ok(false);
        }
        if session.transport().is_closed() {
            self.mark_failed(&session, "connection lost");
            return Ok(false);
        }

        let probe = exec::run(
            &session,
            &self.settings.liveness_command,
            self.settings.liveness_timeout(),
            cancel,
        )
        .await;

        match probe {
            Ok(_) => {
                debug!("[Liveness] {} is alive", session_id);
                Ok(true)
            }
            Err(SshError::Cancelled) => Err(SshError::Cancelled),
            Err(e) => {
                // 会话可能在探测期间被拆除
                if session.state().is_usable() {
                    warn!("[Liveness] Probe on {} failed: {}", session_id, e);
                    self.mark_failed(&session, &format!("liveness probe failed: {}", e));
                }
                Ok(false)
            }
        }
    }

    /// 启动周期性存活检测，只探测空闲超过检测间隔的会话
    pub fn spawn_liveness_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        let interval = self.settings.liveness_interval();
        tokio::spawn(async move {
            info!("[Liveness] Monitor started (interval {:?})", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即完成
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let due: Vec<SessionId> = supervisor
                    .registry
                    .ids()
                    .into_iter()
                    .filter(|id| {
                        supervisor.registry.get(id).is_ok_and(|session| {
                            session.state().is_usable() && session.idle_for() >= interval
                        })
                    })
                    .collect();
                if due.is_empty() {
                    continue;
                }

                debug!("[Liveness] Probing {} idle sessions", due.len());
                let probes = due
                    .iter()
                    .map(|id| supervisor.check_liveness_with_cancel(id, &cancel));
                for (id, result) in due.iter().zip(join_all(probes).await) {
                    match result {
                        Ok(true) => {}
                        Ok(false) => info!("[Liveness] Session {} marked failed", id),
                        Err(SshError::Cancelled) => {}
                        Err(e) => debug!("[Liveness] Skipped {}: {}", id, e),
                    }
                }
            }
            info!("[Liveness] Monitor stopped");
        })
    }

    /// 重连失败的会话，总是返回新的会话 ID
    pub async fn reconnect(
        &self,
        session_id: &SessionId,
        profile: &ServerProfile,
    ) -> Result<SessionId, SshError> {
        self.reconnect_with_cancel(session_id, profile, &CancellationToken::new())
            .await
    }

    pub async fn reconnect_with_cancel(
        &self,
        session_id: &SessionId,
        profile: &ServerProfile,
        cancel: &CancellationToken,
    ) -> Result<SessionId, SshError> {
        let session = self.registry.get(session_id)?;
        let state = session.state();
        if state != SessionState::Failed {
            return Err(SshError::ReconnectRefused {
                id: session_id.to_string(),
                state,
            });
        }
        drop(session);

        // 旧连接先释放
        if let Err(e) = self.teardown_session(session_id).await {
            debug!("[Reconnect] Old session {} already gone: {}", session_id, e);
        }

        let policy = self.reconnect_policy.clone();
        info!(
            "[Reconnect] Reconnecting {} ({} attempts max)",
            profile.label(),
            policy.max_attempts
        );

        let mut attempt = 1u32;
        loop {
            self.emit(SessionEvent::Reconnecting {
                previous: session_id.clone(),
                attempt,
                max_attempts: policy.max_attempts,
            });
            info!(
                "[Reconnect] [{}] Attempt {}/{}",
                profile.label(),
                attempt,
                policy.max_attempts
            );

            match self.connect_session_with_cancel(profile, cancel).await {
                Ok(new_id) => {
                    info!(
                        "[Reconnect] [{}] Reconnected: {} -> {}",
                        profile.label(),
                        session_id,
                        new_id
                    );
                    self.emit(SessionEvent::Reconnected {
                        previous: session_id.clone(),
                        session_id: new_id.clone(),
                    });
                    return Ok(new_id);
                }
                Err(e) if !e.is_retryable() || attempt >= policy.max_attempts => {
                    error!(
                        "[Reconnect] [{}] Giving up after attempt {}: {}",
                        profile.label(),
                        attempt,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        "[Reconnect] [{}] Attempt {}/{} failed: {}, retrying in {:?}",
                        profile.label(),
                        attempt,
                        policy.max_attempts,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SshError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            attempt += 1;
        }
    }

    /// 会话状态
    pub fn state(&self, session_id: &SessionId) -> Result<SessionState, SshError> {
        Ok(self.registry.get(session_id)?.state())
    }

    /// 会话快照
    pub async fn session_info(&self, session_id: &SessionId) -> Result<SessionInfo, SshError> {
        Ok(self.registry.get(session_id)?.info().await)
    }

    /// 拆除所有会话（进程退出前调用）
    pub async fn shutdown_all(&self) {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return;
        }
        info!("[Supervisor] Shutting down {} sessions", ids.len());
        let results = join_all(ids.iter().map(|id| self.teardown_session(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                debug!("[Supervisor] {} already torn down: {}", id, e);
            }
        }
    }
}
