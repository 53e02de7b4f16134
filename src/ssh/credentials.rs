// 凭据解析
// 将服务器档案转换为一次连接尝试所需的认证信息，不访问文件系统

use std::path::PathBuf;

use crate::models::{AuthKind, ServerProfile};

use super::config::AuthMethod;
use super::error::SshError;

/// 认证描述（用户名 + 密码或私钥）
#[derive(Clone, Debug)]
pub struct AuthDescriptor {
    pub username: String,
    pub method: AuthMethod,
}

/// 解析服务器档案中的凭据
pub fn resolve(profile: &ServerProfile) -> Result<AuthDescriptor, SshError> {
    let username = profile.username.trim();
    if username.is_empty() {
        return Err(SshError::InvalidCredentialConfig(
            "username is empty".to_string(),
        ));
    }

    let password = non_empty(profile.password.as_deref());
    let key_path = non_empty(profile.key_path.as_deref());

    let method = match profile.auth_method {
        AuthKind::Password => match (password, key_path) {
            (Some(password), None) => AuthMethod::Password(password.to_string()),
            (None, _) => {
                return Err(SshError::InvalidCredentialConfig(
                    "password authentication selected but no password is set".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(SshError::InvalidCredentialConfig(
                    "password authentication selected but a key path is also set".to_string(),
                ))
            }
        },
        AuthKind::Key => match (key_path, password) {
            (Some(path), None) => AuthMethod::PublicKey {
                key_path: PathBuf::from(path),
                passphrase: non_empty(profile.key_passphrase.as_deref()).map(str::to_string),
            },
            (None, _) => {
                return Err(SshError::InvalidCredentialConfig(
                    "key authentication selected but no key path is set".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(SshError::InvalidCredentialConfig(
                    "key authentication selected but a password is also set".to_string(),
                ))
            }
        },
    };

    Ok(AuthDescriptor {
        username: username.to_string(),
        method,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
