// SSH 客户端 Handler 实现
// 实现 russh::client::Handler trait

use std::future::Future;
use std::sync::{Arc, Mutex};

use russh::keys::PublicKey;
use tokio::sync::mpsc;
use tracing::debug;

use super::config::HostKeyPolicy;
use super::event::SessionEvent;
use super::known_hosts::{HostKeyVerdict, KnownHosts};

/// 握手期间主机密钥校验结果，连接器据此区分 HostKeyRejected 与普通协议错误
pub type VerdictSlot = Arc<Mutex<Option<HostKeyVerdict>>>;

/// SSH 客户端 Handler
pub struct SshClientHandler {
    /// host:port
    address: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHosts>,
    verdict: VerdictSlot,
    /// 事件发送器（用于通知 UI）
    event_sender: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SshClientHandler {
    pub fn new(
        host: &str,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Arc<KnownHosts>,
        event_sender: Option<mpsc::UnboundedSender<SessionEvent>>,
    ) -> (Self, VerdictSlot) {
        let verdict: VerdictSlot = Arc::new(Mutex::new(None));
        let handler = Self {
            address: format!("{}:{}", host, port),
            port,
            policy,
            known_hosts,
            verdict: verdict.clone(),
            event_sender,
        };
        (handler, verdict)
    }
}

impl russh::client::Handler for SshClientHandler {
    type Error = russh::Error;

    /// 检查服务器公钥
    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key
            .fingerprint(russh::keys::ssh_key::HashAlg::Sha256)
            .to_string();
        let key_type = server_public_key.algorithm().to_string();

        debug!(
            "[SSH] Server key for {}: {} {}",
            self.address, key_type, fingerprint
        );

        let verdict = self
            .known_hosts
            .verify(&self.address, &key_type, &fingerprint, self.policy);

        if verdict == HostKeyVerdict::Learned {
            if let Some(sender) = &self.event_sender {
                let host = self
                    .address
                    .rsplit_once(':')
                    .map(|(h, _)| h.to_string())
                    .unwrap_or_else(|| self.address.clone());
                let _ = sender.send(SessionEvent::HostKeyLearned {
                    host,
                    port: self.port,
                    key_type: key_type.clone(),
                    fingerprint: fingerprint.clone(),
                });
            }
        }

        let accepted = verdict.is_accepted();
        *self.verdict.lock().unwrap_or_else(|e| e.into_inner()) = Some(verdict);

        async move { Ok(accepted) }
    }
}
