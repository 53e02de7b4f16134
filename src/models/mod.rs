// 数据模型模块

pub mod known_hosts;
pub mod server;
pub mod settings;

pub use known_hosts::{KnownHost, KnownHostsConfig};
pub use server::{AuthKind, ServerConfig, ServerProfile};
pub use settings::{AppSettings, ConnectionSettings};
