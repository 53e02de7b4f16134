// 服务器可达性检测
// 通过带超时的 TCP 连接判断 SSH 端口是否在线，仅用于状态指示

use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::debug;

use crate::models::ServerProfile;

/// 检测结果
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PingResult {
    pub is_online: bool,
    pub response_time_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl PingResult {
    fn offline(message: impl Into<String>) -> Self {
        Self {
            is_online: false,
            response_time_ms: None,
            error_message: Some(message.into()),
        }
    }
}

/// 检测单个服务器
pub async fn ping_server(host: &str, port: u16, timeout: Duration) -> PingResult {
    let address = format!("{}:{}", host, port);
    let start = Instant::now();

    let result = match tokio::time::timeout(timeout, TcpStream::connect(address.as_str())).await {
        Ok(Ok(_stream)) => PingResult {
            is_online: true,
            response_time_ms: Some(start.elapsed().as_millis() as u64),
            error_message: None,
        },
        Ok(Err(e)) => PingResult::offline(format!("connection failed: {}", e)),
        Err(_) => PingResult::offline(format!("timed out after {}ms", timeout.as_millis())),
    };

    debug!(
        "[Ping] {} online={} ({:?}ms)",
        address, result.is_online, result.response_time_ms
    );
    result
}

/// 并发检测所有服务器，返回 (server_id, 结果)
pub async fn ping_all(servers: &[ServerProfile], timeout: Duration) -> Vec<(String, PingResult)> {
    let results = join_all(
        servers
            .iter()
            .map(|server| ping_server(&server.host, server.port, timeout)),
    )
    .await;
    servers
        .iter()
        .map(|server| server.id.clone())
        .zip(results)
        .collect()
}
