// 电源管理
// Wake-on-LAN 走 UDP 广播，不经过会话；关机通过会话执行远程命令

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::models::ServerProfile;
use crate::ssh::{CommandOutput, SessionId, SessionSupervisor, SshError};

/// 默认关机命令
pub const DEFAULT_SHUTDOWN_COMMAND: &str = "sudo shutdown -h now";
/// 依次尝试的后备命令（Linux / Windows）
const FALLBACK_SHUTDOWN_COMMANDS: [&str; 3] = ["sudo poweroff", "sudo halt", "shutdown -s -t 0"];
const LIMITED_BROADCAST: &str = "255.255.255.255";
const WOL_PORTS: [u16; 2] = [9, 7];

/// 电源操作结果
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PowerResult {
    pub success: bool,
    pub message: String,
    pub details: Option<String>,
}

impl PowerResult {
    fn ok(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: Some(details.into()),
        }
    }

    fn failed(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

/// 远程命令执行能力（关机只依赖这一原语）
#[async_trait]
pub trait RemoteCommandRunner: Send + Sync {
    async fn run_command(
        &self,
        session_id: &SessionId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SshError>;
}

#[async_trait]
impl RemoteCommandRunner for SessionSupervisor {
    async fn run_command(
        &self,
        session_id: &SessionId,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, SshError> {
        SessionSupervisor::run_command(self, session_id, command, timeout).await
    }
}

/// 解析 MAC 地址，支持 `:` `-` 空格分隔或无分隔
pub fn parse_mac(mac: &str) -> Result<[u8; 6], String> {
    let clean: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .collect();
    if clean.len() != 12 {
        return Err(format!(
            "invalid MAC address '{}', expected XX:XX:XX:XX:XX:XX",
            mac
        ));
    }

    let mut bytes = [0u8; 6];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = clean
            .get(i * 2..i * 2 + 2)
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or_else(|| format!("invalid MAC address '{}', use hex digits only", mac))?;
    }
    Ok(bytes)
}

/// 构建 magic packet：6 个 0xFF + 16 次 MAC
pub fn magic_packet(mac: &[u8; 6]) -> [u8; 102] {
    let mut packet = [0xFFu8; 102];
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(mac);
    }
    packet
}

/// 发送 Wake-on-LAN
pub async fn wake_on_lan(mac: &str, broadcast_ip: Option<&str>) -> PowerResult {
    let mac_bytes = match parse_mac(mac) {
        Ok(bytes) => bytes,
        Err(e) => return PowerResult::failed("Invalid MAC address", e),
    };
    let packet = magic_packet(&mac_bytes);

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => return PowerResult::failed("Network setup failed", format!("bind UDP socket: {}", e)),
    };
    if let Err(e) = socket.set_broadcast(true) {
        return PowerResult::failed("Network setup failed", format!("enable broadcast: {}", e));
    }

    let target_ip = broadcast_ip
        .filter(|ip| !ip.trim().is_empty())
        .unwrap_or(LIMITED_BROADCAST);
    let mut sent = 0;
    let mut errors = Vec::new();
    for port in WOL_PORTS {
        let target = format!("{}:{}", target_ip, port);
        match socket.send_to(&packet, target.as_str()).await {
            Ok(_) => {
                info!("[Power] Magic packet for {} sent to {}", mac, target);
                sent += 1;
            }
            Err(e) => {
                warn!("[Power] Failed to send magic packet to {}: {}", target, e);
                errors.push(format!("{} - {}", target, e));
            }
        }
    }

    if sent > 0 {
        PowerResult::ok(
            format!("Magic packet sent ({} targets)", sent),
            format!("Server should power on within 10-60 seconds. MAC: {}", mac),
        )
    } else {
        PowerResult::failed("Failed to send magic packet", errors.join(", "))
    }
}

/// 关机命令列表（自定义命令优先，去重）
pub fn shutdown_commands(profile: &ServerProfile) -> Vec<String> {
    let first = profile
        .shutdown_command
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_SHUTDOWN_COMMAND);

    let mut commands = vec![first.to_string()];
    for fallback in FALLBACK_SHUTDOWN_COMMANDS {
        if !commands.iter().any(|c| c == fallback) {
            commands.push(fallback.to_string());
        }
    }
    commands
}

/// 通过会话关机，依次尝试各个命令
///
/// 第一个退出码为 0 的命令视为成功；命令发出后连接中断也视为成功
pub async fn shutdown_server<R: RemoteCommandRunner + ?Sized>(
    runner: &R,
    session_id: &SessionId,
    profile: &ServerProfile,
    timeout: Duration,
) -> PowerResult {
    let commands = shutdown_commands(profile);
    let mut last_error = String::new();

    for (attempt, command) in commands.iter().enumerate() {
        info!(
            "[Power] Shutdown attempt {}/{} on {}: {}",
            attempt + 1,
            commands.len(),
            profile.label(),
            command
        );
        match runner.run_command(session_id, command, timeout).await {
            Ok(output) if output.is_success() => {
                return PowerResult::ok("Shutdown command executed", format!("Command: {}", command));
            }
            Ok(output) => {
                last_error = format!(
                    "'{}' exited with {:?}: {}",
                    command,
                    output.exit_status,
                    output.stderr_string().trim()
                );
                warn!("[Power] {}", last_error);
            }
            Err(SshError::ConnectionLost(_)) => {
                // 命令已发出，远端在报告退出码之前断开
                return PowerResult::ok(
                    "Connection dropped, server is shutting down",
                    format!("Command: {}", command),
                );
            }
            Err(e @ (SshError::NotFound(_) | SshError::SessionNotConnected(_))) => {
                return PowerResult::failed("Shutdown failed", e.to_string());
            }
            Err(e) => {
                last_error = format!("'{}' failed: {}", command, e);
                warn!("[Power] {}", last_error);
            }
        }
    }

    PowerResult::failed("All shutdown attempts failed", last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedRunner {
        replies: Mutex<Vec<Result<CommandOutput, SshError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(replies: Vec<Result<CommandOutput, SshError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteCommandRunner for ScriptedRunner {
        async fn run_command(
            &self,
            _session_id: &SessionId,
            command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, SshError> {
            self.seen.lock().unwrap().push(command.to_string());
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn exited(code: u32) -> Result<CommandOutput, SshError> {
        Ok(CommandOutput {
            exit_status: Some(code),
            ..Default::default()
        })
    }

    #[test]
    fn parses_mac_with_any_separator() {
        let expected = [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03];
        assert_eq!(parse_mac("AA:BB:CC:01:02:03").unwrap(), expected);
        assert_eq!(parse_mac("aa-bb-cc-01-02-03").unwrap(), expected);
        assert_eq!(parse_mac("aabbcc010203").unwrap(), expected);
        assert!(parse_mac("AA:BB:CC").is_err());
        assert!(parse_mac("GG:BB:CC:01:02:03").is_err());
    }

    #[test]
    fn magic_packet_layout() {
        let mac = [1, 2, 3, 4, 5, 6];
        let packet = magic_packet(&mac);
        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        assert_eq!(&packet[6..12], &mac);
        assert_eq!(&packet[96..], &mac);
    }

    #[tokio::test]
    async fn invalid_mac_is_reported_without_sending() {
        let result = wake_on_lan("not-a-mac", None).await;
        assert!(!result.success);
    }

    #[test]
    fn custom_command_goes_first_without_duplicates() {
        let mut profile = ServerProfile::with_password("s", "h", 22, "root", "x");
        profile.shutdown_command = Some("sudo poweroff".into());
        assert_eq!(
            shutdown_commands(&profile),
            vec!["sudo poweroff", "sudo halt", "shutdown -s -t 0"]
        );

        profile.shutdown_command = None;
        assert_eq!(shutdown_commands(&profile)[0], DEFAULT_SHUTDOWN_COMMAND);
    }

    #[tokio::test]
    async fn falls_back_until_a_command_succeeds() {
        let runner = ScriptedRunner::new(vec![exited(1), exited(127), exited(0)]);
        let profile = ServerProfile::with_password("s", "h", 22, "root", "x");

        let result = shutdown_server(&runner, &SessionId::from("s1"), &profile, Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(
            *runner.seen.lock().unwrap(),
            vec!["sudo shutdown -h now", "sudo poweroff", "sudo halt"]
        );
    }

    #[tokio::test]
    async fn dropped_connection_counts_as_success() {
        let runner = ScriptedRunner::new(vec![Err(SshError::ConnectionLost("eof".into()))]);
        let profile = ServerProfile::with_password("s", "h", 22, "root", "x");

        let result = shutdown_server(&runner, &SessionId::from("s1"), &profile, Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_exit_status_on_live_connection_is_not_success() {
        // 通道被正常关闭但没有退出码，继续尝试下一条命令
        let runner = ScriptedRunner::new(vec![Ok(CommandOutput::default()), exited(0)]);
        let profile = ServerProfile::with_password("s", "h", 22, "root", "x");

        let result = shutdown_server(&runner, &SessionId::from("s1"), &profile, Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(runner.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_session_stops_immediately() {
        let runner = ScriptedRunner::new(vec![Err(SshError::NotFound("s1".into()))]);
        let profile = ServerProfile::with_password("s", "h", 22, "root", "x");

        let result = shutdown_server(&runner, &SessionId::from("s1"), &profile, Duration::from_secs(5)).await;
        assert!(!result.success);
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }
}
