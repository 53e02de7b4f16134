// 已知主机记录
// 以 host:port 为键保存服务器公钥的 SHA256 指纹

use serde::{Deserialize, Serialize};

/// 一条已知主机记录
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KnownHost {
    /// host:port
    pub host: String,
    /// 例如 ssh-ed25519
    pub key_type: String,
    pub fingerprint: String,
    pub first_seen: String,
    pub last_used: String,
}

impl KnownHost {
    /// 新记录，首次与最后使用时间相同
    pub fn new(
        host: impl Into<String>,
        key_type: impl Into<String>,
        fingerprint: impl Into<String>,
        seen_at: impl Into<String>,
    ) -> Self {
        let seen_at = seen_at.into();
        Self {
            host: host.into(),
            key_type: key_type.into(),
            fingerprint: fingerprint.into(),
            first_seen: seen_at.clone(),
            last_used: seen_at,
        }
    }
}

/// known_hosts.json 的内容
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KnownHostsConfig {
    pub hosts: Vec<KnownHost>,
}

impl KnownHostsConfig {
    pub fn find(&self, host: &str) -> Option<&KnownHost> {
        self.hosts.iter().find(|h| h.host == host)
    }

    pub fn find_mut(&mut self, host: &str) -> Option<&mut KnownHost> {
        self.hosts.iter_mut().find(|h| h.host == host)
    }

    /// 写入记录，同一主机只保留一条
    pub fn insert(&mut self, entry: KnownHost) {
        match self.find_mut(&entry.host) {
            Some(existing) => *existing = entry,
            None => self.hosts.push(entry),
        }
    }

    /// 删除主机的记录，返回是否存在
    pub fn remove(&mut self, host: &str) -> bool {
        let before = self.hosts.len();
        self.hosts.retain(|h| h.host != host);
        self.hosts.len() != before
    }
}
