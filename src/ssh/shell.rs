// 交互式 Shell 通道
// 单个后台任务独占 russh 通道：resize 与关闭通过命令队列串行处理，
// 写入转交给独立的写任务，远端窗口写满时输出仍被持续接收。
// 远端输出写入有界缓冲区，并广播给订阅者

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::Transport;
use super::error::SshError;

/// 关闭后等待远端剩余输出的时间
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// resize 等待发送结果的时间
const RESIZE_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// 广播通道容量（以消息计）
const BROADCAST_CAPACITY: usize = 256;

/// PTY 请求参数
#[derive(Clone, Debug)]
pub struct PtyRequest {
    /// 终端类型
    pub term: String,
    /// 列数
    pub col_width: u32,
    /// 行数
    pub row_height: u32,
    /// 像素宽度
    pub pix_width: u32,
    /// 像素高度
    pub pix_height: u32,
    /// 终端模式
    pub modes: Vec<(russh::Pty, u32)>,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            col_width: 80,
            row_height: 24,
            pix_width: 0,
            pix_height: 0,
            modes: vec![],
        }
    }
}

impl PtyRequest {
    pub fn new(term: impl Into<String>, cols: u32, rows: u32) -> Self {
        Self {
            term: term.into(),
            col_width: cols,
            row_height: rows,
            ..Default::default()
        }
    }
}

/// Shell 通道状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellState {
    Uninitialized,
    Requesting,
    Active,
    /// 已请求关闭，仍在接收远端剩余输出
    Draining,
    Closed,
}

/// 非致命操作的确认（resize 等）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShellAck {
    pub warning: Option<String>,
}

impl ShellAck {
    pub fn ok() -> Self {
        Self { warning: None }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            warning: Some(message.into()),
        }
    }
}

/// 待读取的输出缓冲区
///
/// 超出上限时丢弃最旧的字节，并累计丢弃数量
#[derive(Debug)]
pub struct PendingOutput {
    buf: VecDeque<u8>,
    limit: usize,
    dropped: u64,
}

impl PendingOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        // 单次数据超过上限时只保留尾部
        let data = if data.len() > self.limit {
            self.dropped += (data.len() - self.limit) as u64;
            &data[data.len() - self.limit..]
        } else {
            data
        };

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.buf.extend(data);
    }

    /// 取出全部待读数据
    pub fn drain(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 因溢出而丢弃的字节总数
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

enum ShellCommand {
    Data(Vec<u8>),
    Resize {
        cols: u32,
        rows: u32,
        reply: oneshot::Sender<Result<(), SshError>>,
    },
    Close,
}

/// 后台任务与前台共享的状态
struct ShellShared {
    state: Mutex<ShellState>,
    pending: Mutex<PendingOutput>,
    /// 后台任务退出时置空，订阅流随之结束
    output: Mutex<Option<broadcast::Sender<Vec<u8>>>>,
    exit_status: Mutex<Option<u32>>,
    /// 通道没有收到 Close 就结束，底层连接已断开
    connection_lost: Mutex<bool>,
    /// 后台任务退出时取消
    finished: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
}

impl ShellShared {
    fn state(&self) -> ShellState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ShellState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn push_output(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(data);
        if let Some(output) = self.output.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            // 没有订阅者时发送失败是正常情况
            let _ = output.send(data.to_vec());
        }
        self.touch();
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

/// 交互式 Shell 通道
pub struct ShellChannel {
    session_id: String,
    shared: Arc<ShellShared>,
    commands: mpsc::UnboundedSender<ShellCommand>,
    relay: Mutex<Option<JoinHandle<()>>>,
    size: Mutex<(u32, u32)>,
}

impl ShellChannel {
    /// 在已认证的连接上打开 PTY + shell
    ///
    /// PTY 或 shell 请求被拒绝时返回 `ChannelRequestRejected`
    pub async fn open(
        session_id: &str,
        transport: &Transport,
        pty: PtyRequest,
        pending_limit: usize,
        last_activity: Arc<Mutex<Instant>>,
    ) -> Result<Self, SshError> {
        let (output, _) = broadcast::channel(BROADCAST_CAPACITY);
        let shared = Arc::new(ShellShared {
            state: Mutex::new(ShellState::Uninitialized),
            pending: Mutex::new(PendingOutput::new(pending_limit)),
            output: Mutex::new(Some(output)),
            exit_status: Mutex::new(None),
            connection_lost: Mutex::new(false),
            finished: CancellationToken::new(),
            last_activity,
        });

        shared.set_state(ShellState::Requesting);
        let mut channel = transport.open_session_channel().await?;

        channel
            .request_pty(
                true,
                &pty.term,
                pty.col_width,
                pty.row_height,
                pty.pix_width,
                pty.pix_height,
                &pty.modes,
            )
            .await
            .map_err(SshError::from)?;
        wait_for_reply(&mut channel, "pty-req", &shared).await?;

        channel.request_shell(true).await.map_err(SshError::from)?;
        wait_for_reply(&mut channel, "shell", &shared).await?;

        shared.set_state(ShellState::Active);
        shared.touch();
        info!(
            "[Shell] Opened {}x{} {} shell for session {}",
            pty.col_width, pty.row_height, pty.term, session_id
        );

        let (commands, command_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(run_relay(
            session_id.to_string(),
            channel,
            command_rx,
            shared.clone(),
        ));

        Ok(Self {
            session_id: session_id.to_string(),
            shared,
            commands,
            relay: Mutex::new(Some(relay)),
            size: Mutex::new((pty.col_width, pty.row_height)),
        })
    }

    pub fn state(&self) -> ShellState {
        self.shared.state()
    }

    /// 通道已关闭或正在关闭
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ShellState::Draining | ShellState::Closed)
    }

    /// 远端 shell 的退出码（如果已退出）
    pub fn exit_status(&self) -> Option<u32> {
        *self
            .shared
            .exit_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// 远端没有关闭通道，而是整个连接断开
    pub fn connection_lost(&self) -> bool {
        *self
            .shared
            .connection_lost
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// 后台任务退出（远端退出、连接断开或本地关闭）时取消的令牌
    pub fn finished(&self) -> CancellationToken {
        self.shared.finished.clone()
    }

    /// 当前终端尺寸 (cols, rows)
    pub fn size(&self) -> (u32, u32) {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 写入数据（按提交顺序发送）
    pub fn write(&self, data: &[u8]) -> Result<(), SshError> {
        if self.is_closed() {
            return Err(SshError::ChannelClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.commands
            .send(ShellCommand::Data(data.to_vec()))
            .map_err(|_| SshError::ChannelClosed)
    }

    /// 取出自上次读取以来的全部输出，没有数据时返回空
    pub fn read(&self) -> Vec<u8> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
    }

    /// 当前待读字节数
    pub fn pending_len(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dropped()
    }

    /// 订阅后续输出
    ///
    /// 订阅者与 `read` 相互独立，订阅不会消耗待读缓冲区。
    /// 订阅者处理过慢时跳过落后的数据块。通道关闭后流结束
    pub fn subscribe(&self) -> BoxStream<'static, Vec<u8>> {
        let rx = match self.shared.output.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(output) => output.subscribe(),
            None => return stream::empty().boxed(),
        };
        let session_id = self.session_id.clone();
        stream::unfold((rx, session_id), |(mut rx, session_id)| async move {
            loop {
                match rx.recv().await {
                    Ok(chunk) => return Some((chunk, (rx, session_id))),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "[Shell] Subscriber of session {} lagged, skipped {} chunks",
                            session_id, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// 调整终端尺寸，失败只产生警告
    pub async fn resize(&self, cols: u32, rows: u32) -> ShellAck {
        if self.is_closed() {
            return ShellAck::warn("shell is closed, resize ignored");
        }

        let (reply, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(ShellCommand::Resize { cols, rows, reply })
            .is_err()
        {
            return ShellAck::warn("shell is closed, resize ignored");
        }

        match tokio::time::timeout(RESIZE_ACK_TIMEOUT, reply_rx).await {
            Ok(Ok(Ok(()))) => {
                *self.size.lock().unwrap_or_else(|e| e.into_inner()) = (cols, rows);
                debug!(
                    "[Shell] Resized session {} to {}x{}",
                    self.session_id, cols, rows
                );
                ShellAck::ok()
            }
            Ok(Ok(Err(e))) => {
                warn!("[Shell] Resize failed for session {}: {}", self.session_id, e);
                ShellAck::warn(format!("resize failed: {}", e))
            }
            Ok(Err(_)) => ShellAck::warn("shell closed before resize was sent"),
            Err(_) => {
                warn!("[Shell] Resize timed out for session {}", self.session_id);
                ShellAck::warn("resize timed out")
            }
        }
    }

    /// 关闭通道，可重复调用
    pub async fn close(&self, wait: Duration) {
        let relay = self
            .relay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut relay) = relay else {
            return;
        };

        if self.state() != ShellState::Closed {
            self.shared.set_state(ShellState::Draining);
        }
        let _ = self.commands.send(ShellCommand::Close);

        if tokio::time::timeout(wait, &mut relay).await.is_err() {
            warn!(
                "[Shell] Relay for session {} did not stop in {:?}, aborting",
                self.session_id, wait
            );
            relay.abort();
            self.shared.set_state(ShellState::Closed);
        }
        debug!("[Shell] Closed shell for session {}", self.session_id);
    }
}

impl Drop for ShellChannel {
    fn drop(&mut self) {
        // 丢弃命令发送端后，后台任务会自行关闭通道
        let _ = self.commands.send(ShellCommand::Close);
    }
}

/// 等待 want_reply 请求的结果，期间到达的输出先放入缓冲区
async fn wait_for_reply(
    channel: &mut Channel<Msg>,
    request: &str,
    shared: &ShellShared,
) -> Result<(), SshError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => {
                return Err(SshError::ChannelRequestRejected(format!(
                    "{} request refused by server",
                    request
                )))
            }
            Some(ChannelMsg::Data { data }) => shared.push_output(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => shared.push_output(&data),
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(SshError::ChannelRequestRejected(format!(
                    "channel closed while waiting for {} reply",
                    request
                )))
            }
            Some(_) => {}
        }
    }
}

/// 后台转发任务
async fn run_relay(
    session_id: String,
    mut channel: Channel<Msg>,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
    shared: Arc<ShellShared>,
) {
    let (writes, write_rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(run_writer(
        session_id.clone(),
        channel.make_writer(),
        write_rx,
        shared.clone(),
    ));
    let mut local_close = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ShellCommand::Data(data)) => {
                    // 写任务已退出时数据随之丢弃，连接状态由读取侧判断
                    let _ = writes.send(data);
                }
                Some(ShellCommand::Resize { cols, rows, reply }) => {
                    let result = channel
                        .window_change(cols, rows, 0, 0)
                        .await
                        .map_err(SshError::from);
                    let _ = reply.send(result);
                }
                Some(ShellCommand::Close) | None => {
                    local_close = true;
                    break;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => shared.push_output(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => shared.push_output(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("[Shell] Remote shell of session {} exited with {}", session_id, exit_status);
                    *shared.exit_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(exit_status);
                }
                Some(ChannelMsg::Eof) => {
                    debug!("[Shell] EOF from remote shell of session {}", session_id);
                }
                Some(ChannelMsg::Close) => break,
                None => {
                    *shared.connection_lost.lock().unwrap_or_else(|e| e.into_inner()) = true;
                    break;
                }
                Some(_) => {}
            },
        }
    }

    // 写任务发完队列中的数据后自行退出
    drop(writes);

    if local_close {
        shared.set_state(ShellState::Draining);
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
            warn!("[Shell] Pending input of session {} not flushed, discarding", session_id);
            writer.abort();
        }
        let _ = channel.eof().await;
        let _ = channel.close().await;
        // 关闭请求发出后仍可能有输出到达
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(message) = channel.wait().await {
                match message {
                    ChannelMsg::Data { data } => shared.push_output(&data),
                    ChannelMsg::ExtendedData { data, .. } => shared.push_output(&data),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
        })
        .await;
    } else {
        writer.abort();
        if *shared.connection_lost.lock().unwrap_or_else(|e| e.into_inner()) {
            warn!("[Shell] Connection of session {} lost while shell was open", session_id);
        } else {
            info!("[Shell] Remote closed shell of session {}", session_id);
        }
    }

    shared.set_state(ShellState::Closed);
    shared.output.lock().unwrap_or_else(|e| e.into_inner()).take();
    shared.finished.cancel();
}

/// 写任务：按提交顺序把输入写入通道
///
/// 远端窗口耗尽时在这里等待，不影响转发任务接收输出
async fn run_writer<W>(
    session_id: String,
    writer: W,
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<ShellShared>,
) where
    W: AsyncWrite + Send + 'static,
{
    let mut writer = Box::pin(writer);
    while let Some(data) = writes.recv().await {
        let written = async {
            writer.write_all(&data).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("[Shell] Write failed for session {}: {}", session_id, e);
            break;
        }
        shared.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_output_keeps_newest_bytes() {
        let mut pending = PendingOutput::new(8);
        pending.push(b"abcdef");
        pending.push(b"ghij");
        assert_eq!(pending.len(), 8);
        assert_eq!(pending.dropped(), 2);
        assert_eq!(pending.drain(), b"cdefghij".to_vec());
        assert!(pending.is_empty());
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut pending = PendingOutput::new(4);
        pending.push(b"xy");
        pending.push(b"0123456789");
        assert_eq!(pending.drain(), b"6789".to_vec());
        assert_eq!(pending.dropped(), 8);
    }

    #[test]
    fn drain_on_empty_buffer_returns_nothing() {
        let mut pending = PendingOutput::new(16);
        assert!(pending.drain().is_empty());
        assert_eq!(pending.dropped(), 0);
    }

    #[test]
    fn pty_request_uses_requested_size() {
        let pty = PtyRequest::new("vt100", 120, 40);
        assert_eq!(pty.term, "vt100");
        assert_eq!((pty.col_width, pty.row_height), (120, 40));
        assert_eq!(pty.pix_width, 0);
    }
}
