// 远程命令执行
// 每条命令使用独立的 exec 通道，与 Shell 互不影响

use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use serde::Serialize;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::SshError;
use super::session::Session;

/// 命令输出
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: Vec<u8>,
    /// 标准错误
    pub stderr: Vec<u8>,
    /// 退出码，远端未报告时为 None
    pub exit_status: Option<u32>,
    /// 被信号终止时的信号名
    pub exit_signal: Option<String>,
}

impl CommandOutput {
    /// 获取标准输出字符串
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// 获取标准错误字符串
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// 检查命令是否成功
    pub fn is_success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

enum Outcome {
    Finished(Result<CommandOutput, SshError>),
    TimedOut,
    Cancelled,
}

/// 在会话上执行一条命令
///
/// 超时后向远端发送 KILL 并关闭通道，已收到的部分输出被丢弃。
/// 超时不影响会话本身。执行途中传输层断开返回 `ConnectionLost`，
/// 部分输出同样被丢弃
pub async fn run(
    session: &Session,
    command: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, SshError> {
    if !session.state().is_usable() {
        return Err(SshError::SessionNotConnected(session.id().to_string()));
    }
    if session.transport().is_closed() {
        return Err(SshError::SessionNotConnected(session.id().to_string()));
    }

    let deadline = Instant::now() + timeout;
    debug!("[Exec] {} $ {}", session.id(), command);

    let mut channel = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SshError::Cancelled),
        opened = timeout_at(deadline, session.transport().open_session_channel()) => match opened {
            Ok(channel) => channel?,
            Err(_) => return Err(SshError::CommandTimedOut(timeout)),
        },
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        result = timeout_at(deadline, execute(&mut channel, command)) => match result {
            Ok(result) => Outcome::Finished(result),
            Err(_) => Outcome::TimedOut,
        },
    };

    // 没有退出码且连接已断开时，不能把部分输出当作完成
    let outcome = match outcome {
        Outcome::Finished(Ok(output))
            if output.exit_status.is_none()
                && output.exit_signal.is_none()
                && session.transport().is_closed() =>
        {
            Outcome::Finished(Err(SshError::ConnectionLost(
                "transport closed before exit status".to_string(),
            )))
        }
        other => other,
    };

    match outcome {
        Outcome::Finished(Err(SshError::ConnectionLost(reason))) => {
            warn!(
                "[Exec] Connection of {} lost while running `{}`: {}",
                session.id(),
                command,
                reason
            );
            Err(SshError::ConnectionLost(reason))
        }
        Outcome::Finished(result) => {
            session.touch();
            result
        }
        Outcome::TimedOut => {
            warn!(
                "[Exec] Command on {} timed out after {:?}: {}",
                session.id(),
                timeout,
                command
            );
            abandon(&channel).await;
            Err(SshError::CommandTimedOut(timeout))
        }
        Outcome::Cancelled => {
            debug!("[Exec] Command on {} cancelled", session.id());
            abandon(&channel).await;
            Err(SshError::Cancelled)
        }
    }
}

/// 发送 exec 请求并收集输出，直到远端关闭通道
async fn execute(channel: &mut Channel<Msg>, command: &str) -> Result<CommandOutput, SshError> {
    channel.exec(true, command).await.map_err(SshError::from)?;

    let mut output = CommandOutput::default();
    let mut confirmed = false;

    // exit-status 可能在 EOF 之后到达，因此读到 Close 为止
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => confirmed = true,
            Some(ChannelMsg::Failure) if !confirmed => {
                return Err(SshError::ChannelRequestRejected(
                    "exec request refused by server".to_string(),
                ));
            }
            Some(ChannelMsg::Data { data }) => output.stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    // stderr
                    output.stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => output.exit_status = Some(exit_status),
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                output.exit_signal = Some(format!("{:?}", signal_name));
            }
            Some(ChannelMsg::Close) => break,
            // 通道发送端被丢弃而没有 Close，说明底层连接已断开
            None => {
                return Err(SshError::ConnectionLost(
                    "channel ended without close".to_string(),
                ));
            }
            Some(_) => {}
        }
    }

    Ok(output)
}

async fn abandon(channel: &Channel<Msg>) {
    let _ = channel.signal(russh::Sig::KILL).await;
    let _ = channel.close().await;
}
