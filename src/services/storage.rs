// 本地数据持久化服务
// 服务器档案只读；设置与已知主机可读写

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::models::{AppSettings, KnownHostsConfig, ServerConfig, ServerProfile};

const SERVERS_FILE: &str = "servers.json";
const SETTINGS_FILE: &str = "settings.json";
const KNOWN_HOSTS_FILE: &str = "known_hosts.json";

/// 获取配置目录路径
/// macOS: ~/Library/Application Support/shellcore
/// Linux: ~/.config/shellcore
/// Windows: C:\Users\<用户名>\AppData\Roaming\shellcore
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("无法获取系统配置目录")?
        .join("shellcore");
    if !config_dir.exists() {
        fs::create_dir_all(&config_dir).context("无法创建配置目录")?;
    }
    Ok(config_dir)
}

/// 已知主机文件路径
pub fn known_hosts_file(config_dir: &Path) -> PathBuf {
    config_dir.join(KNOWN_HOSTS_FILE)
}

/// 读取 JSON 文件，不存在时返回默认值
fn load_json<T: DeserializeOwned + Default>(path: &Path, what: &str) -> Result<T> {
    if !path.exists() {
        debug!("[Storage] {} not found, using defaults", path.display());
        return Ok(T::default());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("无法读取{}: {}", what, path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("无法解析{}: {}", what, path.display()))
}

fn save_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("无法创建配置目录")?;
    }
    let content =
        serde_json::to_string_pretty(value).with_context(|| format!("无法序列化{}", what))?;
    fs::write(path, content).with_context(|| format!("无法写入{}: {}", what, path.display()))?;
    Ok(())
}

// ======================== 服务器档案（只读） ========================

/// 加载服务器配置
pub fn load_servers(config_dir: &Path) -> Result<ServerConfig> {
    load_json(&config_dir.join(SERVERS_FILE), "服务器配置文件")
}

/// 按 ID 查找服务器
pub fn find_server(config_dir: &Path, server_id: &str) -> Result<ServerProfile> {
    load_servers(config_dir)?
        .servers
        .into_iter()
        .find(|s| s.id == server_id)
        .with_context(|| format!("找不到服务器: {}", server_id))
}

// ======================== Settings 配置持久化 ========================

/// 加载应用设置
pub fn load_settings(config_dir: &Path) -> Result<AppSettings> {
    load_json(&config_dir.join(SETTINGS_FILE), "设置配置文件")
}

/// 保存应用设置
pub fn save_settings(config_dir: &Path, settings: &AppSettings) -> Result<()> {
    save_json(&config_dir.join(SETTINGS_FILE), settings, "设置配置")
}

// ======================== Known hosts 持久化 ========================

/// 加载已知主机
pub fn load_known_hosts(path: &Path) -> Result<KnownHostsConfig> {
    load_json(path, "已知主机文件")
}

/// 保存已知主机
pub fn save_known_hosts(path: &Path, config: &KnownHostsConfig) -> Result<()> {
    save_json(path, config, "已知主机")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_servers(dir.path()).unwrap().servers.is_empty());
        assert_eq!(
            load_settings(dir.path()).unwrap().connection.connection_timeout_secs,
            30
        );
        assert!(load_known_hosts(&known_hosts_file(dir.path()))
            .unwrap()
            .hosts
            .is_empty());
    }

    #[test]
    fn finds_server_by_id() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SERVERS_FILE),
            r#"{ "servers": [
                { "id": "a", "host": "10.0.0.5", "username": "root", "authMethod": "password", "password": "secret" },
                { "id": "b", "host": "10.0.0.6", "username": "deploy", "authMethod": "key", "keyPath": "/k" }
            ] }"#,
        )
        .unwrap();

        let server = find_server(dir.path(), "b").unwrap();
        assert_eq!(server.host, "10.0.0.6");
        assert_eq!(server.port, 22);
        assert!(find_server(dir.path(), "zzz").is_err());
    }

    #[test]
    fn settings_round_trip_through_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let mut settings = AppSettings::default();
        settings.connection.reconnect_attempts = 9;
        save_settings(&nested, &settings).unwrap();
        assert_eq!(load_settings(&nested).unwrap().connection.reconnect_attempts, 9);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();
        assert!(load_settings(dir.path()).is_err());
    }
}
