// 服务器连接档案

use serde::{Deserialize, Serialize};

/// 认证方式
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Password,
    Key,
}

/// 服务器档案（由外部存储持有，会话核心只读）
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthKind,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub key_passphrase: Option<String>,
    pub mac_address: Option<String>,
    pub broadcast_ip: Option<String>,
    pub shutdown_command: Option<String>,
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            host: String::new(),
            port: 22,
            username: String::new(),
            auth_method: AuthKind::Password,
            password: None,
            key_path: None,
            key_passphrase: None,
            mac_address: None,
            broadcast_ip: None,
            shutdown_command: None,
        }
    }
}

impl ServerProfile {
    /// 使用密码认证的档案
    pub fn with_password(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            username: username.into(),
            auth_method: AuthKind::Password,
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// 使用私钥认证的档案
    pub fn with_key(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            username: username.into(),
            auth_method: AuthKind::Key,
            key_path: Some(key_path.into()),
            ..Default::default()
        }
    }

    /// 用于日志与 UI 的显示名称
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{}@{}:{}", self.username, self.host, self.port)
        } else {
            self.name.clone()
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// 密码和口令不进入日志
impl std::fmt::Debug for ServerProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("mac_address", &self.mac_address)
            .field("shutdown_command", &self.shutdown_command)
            .finish()
    }
}

/// 服务器列表文件（servers.json）
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    pub servers: Vec<ServerProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_profile() {
        let json = r#"{
            "id": "srv-1",
            "host": "10.0.0.5",
            "port": 22,
            "username": "root",
            "authMethod": "password",
            "password": "secret",
            "macAddress": "AA:BB:CC:DD:EE:FF",
            "shutdownCommand": "sudo poweroff"
        }"#;
        let profile: ServerProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.auth_method, AuthKind::Password);
        assert_eq!(profile.password.as_deref(), Some("secret"));
        assert_eq!(profile.mac_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(profile.shutdown_command.as_deref(), Some("sudo poweroff"));
        assert!(profile.key_path.is_none());
    }

    #[test]
    fn debug_output_hides_password() {
        let profile = ServerProfile::with_password("a", "h", 22, "root", "hunter2");
        let printed = format!("{:?}", profile);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn label_falls_back_to_address() {
        let mut profile = ServerProfile::with_password("a", "10.0.0.5", 2222, "root", "x");
        assert_eq!(profile.label(), "root@10.0.0.5:2222");
        profile.name = "nas".into();
        assert_eq!(profile.label(), "nas");
    }
}
