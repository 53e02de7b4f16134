// 主机密钥校验
// 首次连接记录指纹（TOFU），之后指纹变化一律拒绝

use std::path::PathBuf;
use std::sync::RwLock;

use tracing::{error, info, warn};

use crate::models::{KnownHost, KnownHostsConfig};
use crate::services::storage;

use super::config::HostKeyPolicy;

/// 校验结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyVerdict {
    /// 已知主机，指纹一致
    Trusted,
    /// 未知主机，已按 AcceptNew 策略记录
    Learned,
    /// 未知主机，Strict 策略拒绝
    Unknown,
    /// 指纹与记录不一致
    Mismatch { expected: String },
}

impl HostKeyVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Trusted | Self::Learned)
    }
}

/// 已知主机存储
pub struct KnownHosts {
    config: RwLock<KnownHostsConfig>,
    /// 持久化文件，None 表示仅在内存中
    path: Option<PathBuf>,
}

impl KnownHosts {
    /// 仅内存的存储（测试或一次性会话）
    pub fn in_memory() -> Self {
        Self {
            config: RwLock::new(KnownHostsConfig::default()),
            path: None,
        }
    }

    /// 从文件加载，写入时回存到同一文件
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let config = storage::load_known_hosts(&path)?;
        info!(
            "[KnownHosts] Loaded {} entries from {}",
            config.hosts.len(),
            path.display()
        );
        Ok(Self {
            config: RwLock::new(config),
            path: Some(path),
        })
    }

    /// 查询记录的指纹
    pub fn fingerprint_for(&self, host: &str) -> Option<String> {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config.find(host).map(|h| h.fingerprint.clone())
    }

    pub fn len(&self) -> usize {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        config.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 校验服务器公钥
    pub fn verify(
        &self,
        host: &str,
        key_type: &str,
        fingerprint: &str,
        policy: HostKeyPolicy,
    ) -> HostKeyVerdict {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let verdict = {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            match config.find_mut(host) {
                Some(known) if known.fingerprint == fingerprint => {
                    known.last_used = now;
                    HostKeyVerdict::Trusted
                }
                Some(known) => HostKeyVerdict::Mismatch {
                    expected: known.fingerprint.clone(),
                },
                None => match policy {
                    HostKeyPolicy::Strict => HostKeyVerdict::Unknown,
                    HostKeyPolicy::AcceptNew => {
                        config.insert(KnownHost::new(host, key_type, fingerprint, now));
                        HostKeyVerdict::Learned
                    }
                },
            }
        };

        match &verdict {
            HostKeyVerdict::Trusted => {}
            HostKeyVerdict::Learned => {
                warn!(
                    "[KnownHosts] Accepting new host key for {} ({} {})",
                    host, key_type, fingerprint
                );
                self.persist();
            }
            HostKeyVerdict::Unknown => {
                warn!(
                    "[KnownHosts] Rejecting unknown host {} under strict checking ({})",
                    host, fingerprint
                );
            }
            HostKeyVerdict::Mismatch { expected } => {
                error!(
                    "[KnownHosts] Host key for {} changed! Expected {}, got {}",
                    host, expected, fingerprint
                );
            }
        }

        verdict
    }

    /// 删除记录（用户确认密钥更换后使用）
    pub fn forget(&self, host: &str) -> bool {
        let removed = {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            config.remove(host)
        };
        if removed {
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        let Some(path) = &self.path else {
            return;
        };
        let snapshot = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Err(e) = storage::save_known_hosts(path, &snapshot) {
            error!("[KnownHosts] Failed to save {}: {:#}", path.display(), e);
        }
    }
}
