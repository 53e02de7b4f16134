// SSH 会话
// 一个已认证连接及其附属资源（至多一个 Shell 通道）

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::Transport;
use super::event::SessionState;
use super::registry::SessionId;
use super::shell::ShellChannel;

/// SSH 会话（连接成功后）
pub struct Session {
    id: SessionId,
    server_id: String,
    host: String,
    username: String,
    transport: Transport,
    /// 至多一个交互式 Shell，锁只在同步代码中短暂持有
    shell: Mutex<ShellSlot>,
    state: Mutex<SessionState>,
    last_activity: Arc<Mutex<Instant>>,
    created_at: DateTime<Local>,
}

/// Shell 槽位
pub(crate) enum ShellSlot {
    Empty,
    /// 正在请求 PTY 与 shell，取消令牌用于中止打开
    Opening(CancellationToken),
    Open(Arc<ShellChannel>),
}

impl ShellSlot {
    /// 是否有打开中或仍在运行的 Shell
    pub(crate) fn is_busy(&self) -> bool {
        match self {
            ShellSlot::Empty => false,
            ShellSlot::Opening(_) => true,
            ShellSlot::Open(shell) => !shell.is_closed(),
        }
    }

    /// 清空槽位并中止进行中的打开，返回已打开的 Shell
    pub(crate) fn clear(&mut self) -> Option<Arc<ShellChannel>> {
        match std::mem::replace(self, ShellSlot::Empty) {
            ShellSlot::Empty => None,
            ShellSlot::Opening(cancel) => {
                cancel.cancel();
                None
            }
            ShellSlot::Open(shell) => Some(shell),
        }
    }
}

/// 会话快照（供 UI 展示）
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub server_id: String,
    pub host: String,
    pub username: String,
    pub state: SessionState,
    pub shell_open: bool,
    pub created_at: DateTime<Local>,
    pub idle_secs: u64,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        server_id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            id,
            server_id: server_id.into(),
            host: host.into(),
            username: username.into(),
            transport,
            shell: Mutex::new(ShellSlot::Empty),
            state: Mutex::new(SessionState::Connecting),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            created_at: Local::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn shell_slot(&self) -> std::sync::MutexGuard<'_, ShellSlot> {
        self.shell.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn activity_clock(&self) -> Arc<Mutex<Instant>> {
        self.last_activity.clone()
    }

    /// 当前状态
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 状态转换，非法转换返回 false 且状态不变
    pub(crate) fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == next {
            return false;
        }
        if !state.can_transition_to(next) {
            warn!(
                "[Session] Ignoring transition {:?} -> {:?} for {}",
                *state, next, self.id
            );
            return false;
        }
        debug!("[Session] {}: {:?} -> {:?}", self.id, *state, next);
        *state = next;
        true
    }

    /// 进入 Closing，只有第一个调用者成功
    pub(crate) fn begin_closing(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.can_transition_to(SessionState::Closing) {
            *state = SessionState::Closing;
            true
        } else {
            false
        }
    }

    /// 记录一次活动
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// 距上次活动的时间
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// 会话快照
    pub async fn info(&self) -> SessionInfo {
        let shell_open = matches!(
            &*self.shell_slot(),
            ShellSlot::Open(shell) if !shell.is_closed()
        );
        SessionInfo {
            id: self.id.clone(),
            server_id: self.server_id.clone(),
            host: self.host.clone(),
            username: self.username.clone(),
            state: self.state(),
            shell_open,
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }
}
