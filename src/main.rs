// ShellCore - SSH 会话核心命令行
// 应用入口

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shellcore::models::{AppSettings, ServerProfile};
use shellcore::services::{power, reachability, storage};
use shellcore::ssh::{KnownHosts, LogLevel, SessionEvent, SessionRegistry, SessionSupervisor};

/// SSH session core command line
#[derive(Parser, Debug)]
#[command(name = "shellcore")]
#[command(about = "SSH session and interactive shell core")]
#[command(version)]
struct Cli {
    /// Configuration directory (servers.json, settings.json, known_hosts.json)
    #[arg(long, env = "SHELLCORE_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List configured servers
    List,
    /// Check whether servers accept TCP connections on their SSH port
    Ping {
        /// Server ID (all servers when omitted)
        server_id: Option<String>,
    },
    /// Run one command on a server
    Exec {
        server_id: String,
        /// Timeout in seconds (defaults to settings)
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Open an interactive shell on a server
    Shell { server_id: String },
    /// Send a Wake-on-LAN magic packet to a server
    Wake { server_id: String },
    /// Shut a server down over SSH
    Shutdown { server_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    // 可以通过 RUST_LOG 环境变量控制日志级别，例如：RUST_LOG=debug shellcore list
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false) // 不显示 target（模块路径）
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => storage::get_config_dir()?,
    };
    let settings = storage::load_settings(&config_dir)?;

    match cli.command {
        Commands::List => list(&config_dir),
        Commands::Ping { server_id } => ping(&config_dir, &settings, server_id.as_deref()).await,
        Commands::Exec {
            server_id,
            timeout,
            command,
        } => {
            let profile = storage::find_server(&config_dir, &server_id)?;
            exec(&config_dir, &settings, &profile, timeout, &command.join(" ")).await
        }
        Commands::Shell { server_id } => {
            let profile = storage::find_server(&config_dir, &server_id)?;
            shell(&config_dir, &settings, &profile).await
        }
        Commands::Wake { server_id } => {
            let profile = storage::find_server(&config_dir, &server_id)?;
            let mac = profile
                .mac_address
                .as_deref()
                .with_context(|| format!("server {} has no MAC address", server_id))?;
            report(power::wake_on_lan(mac, profile.broadcast_ip.as_deref()).await)
        }
        Commands::Shutdown { server_id } => {
            let profile = storage::find_server(&config_dir, &server_id)?;
            shutdown(&config_dir, &settings, &profile).await
        }
    }
}

fn list(config_dir: &Path) -> Result<()> {
    let config = storage::load_servers(config_dir)?;
    if config.servers.is_empty() {
        println!("No servers configured in {}", config_dir.display());
    }
    for server in &config.servers {
        println!(
            "{:<16} {:<24} {}@{}:{} ({:?})",
            server.id,
            server.label(),
            server.username,
            server.host,
            server.port,
            server.auth_method
        );
    }
    Ok(())
}

async fn ping(config_dir: &Path, settings: &AppSettings, server_id: Option<&str>) -> Result<()> {
    let servers = match server_id {
        Some(id) => vec![storage::find_server(config_dir, id)?],
        None => storage::load_servers(config_dir)?.servers,
    };
    let timeout = settings.connection.connect_timeout().min(Duration::from_secs(5));
    for (id, result) in reachability::ping_all(&servers, timeout).await {
        match (result.is_online, result.response_time_ms) {
            (true, Some(ms)) => println!("{:<16} online  {}ms", id, ms),
            _ => println!(
                "{:<16} offline {}",
                id,
                result.error_message.unwrap_or_default()
            ),
        }
    }
    Ok(())
}

/// 构建监管器，并把会话事件转成日志
fn supervisor(config_dir: &Path, settings: &AppSettings) -> Result<Arc<SessionSupervisor>> {
    let known_hosts = KnownHosts::load(storage::known_hosts_file(config_dir))?;
    let (supervisor, events) = SessionSupervisor::new(
        Arc::new(SessionRegistry::new()),
        Arc::new(known_hosts),
        settings.connection.clone(),
    );
    tokio::spawn(log_events(events));
    Ok(Arc::new(supervisor))
}

async fn log_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::StateChanged { session_id, state, .. } => {
                info!("[Session] {} -> {}", session_id, state.as_str())
            }
            SessionEvent::Stage { stage, .. } => {
                info!("[SSH] {} ({:.0}%)", stage.label(), stage.progress() * 100.0)
            }
            SessionEvent::HostKeyLearned {
                host,
                port,
                key_type,
                fingerprint,
            } => warn!(
                "[SSH] Learned new host key for {}:{}: {} {}",
                host, port, key_type, fingerprint
            ),
            SessionEvent::Log { session_id, entry } => match entry.level {
                // 阶段事件已经以 INFO 输出
                LogLevel::Debug | LogLevel::Info => debug!("[SSH] {}: {}", session_id, entry.message),
                LogLevel::Warn => warn!("[SSH] {}: {}", session_id, entry.message),
                LogLevel::Error => error!("[SSH] {}: {}", session_id, entry.message),
            },
            SessionEvent::Reconnecting {
                previous,
                attempt,
                max_attempts,
            } => info!("[Reconnect] {} attempt {}/{}", previous, attempt, max_attempts),
            SessionEvent::Reconnected {
                previous,
                session_id,
            } => info!("[Reconnect] {} replaced by {}", previous, session_id),
            SessionEvent::Warning { session_id, message } => {
                warn!("[Session] {}: {}", session_id, message)
            }
        }
    }
}

async fn exec(
    config_dir: &Path,
    settings: &AppSettings,
    profile: &ServerProfile,
    timeout: Option<u64>,
    command: &str,
) -> Result<()> {
    let supervisor = supervisor(config_dir, settings)?;
    let session_id = supervisor.connect_session(profile).await?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.connection.command_timeout());

    let result = supervisor.run_command(&session_id, command, timeout).await;
    supervisor.shutdown_all().await;
    let output = result?;

    let mut stdout = tokio::io::stdout();
    stdout.write_all(&output.stdout).await?;
    stdout.flush().await?;
    let mut stderr = tokio::io::stderr();
    stderr.write_all(&output.stderr).await?;
    stderr.flush().await?;

    match output.exit_status {
        Some(0) => Ok(()),
        Some(code) => std::process::exit(code as i32),
        None => bail!("remote command ended without exit status ({:?})", output.exit_signal),
    }
}

async fn shell(config_dir: &Path, settings: &AppSettings, profile: &ServerProfile) -> Result<()> {
    let supervisor = supervisor(config_dir, settings)?;
    let session_id = supervisor.connect_session(profile).await?;
    supervisor.open_shell(&session_id, 80, 24).await?;

    // 订阅流只用来唤醒，数据统一从待读缓冲区取出，每段输出只打印一次
    let mut wakeups = supervisor.subscribe_shell(&session_id).await?;
    let mut printer = tokio::spawn({
        let supervisor = supervisor.clone();
        let session_id = session_id.clone();
        async move {
            let mut stdout = tokio::io::stdout();
            loop {
                // 第一次读取拿到订阅之前已到达的输出（登录提示等）
                let Ok(data) = supervisor.read_shell(&session_id).await else {
                    break;
                };
                if !data.is_empty() {
                    if stdout.write_all(&data).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                if wakeups.next().await.is_none() {
                    if let Ok(rest) = supervisor.read_shell(&session_id).await {
                        let _ = stdout.write_all(&rest).await;
                        let _ = stdout.flush().await;
                    }
                    break;
                }
            }
        }
    });

    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 1024];
    let mut remote_closed = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[Shell] Interrupted");
                break;
            }
            _ = &mut printer => {
                // 远端 shell 已退出
                remote_closed = true;
                break;
            }
            read = stdin.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Err(e) = supervisor.write_shell(&session_id, &buf[..n]).await {
                        warn!("[Shell] {}", e);
                        break;
                    }
                }
            },
        }
    }

    supervisor.shutdown_all().await;
    if !remote_closed {
        let _ = printer.await;
    }
    Ok(())
}

async fn shutdown(config_dir: &Path, settings: &AppSettings, profile: &ServerProfile) -> Result<()> {
    let supervisor = supervisor(config_dir, settings)?;
    let session_id = supervisor.connect_session(profile).await?;
    let result = power::shutdown_server(
        supervisor.as_ref(),
        &session_id,
        profile,
        settings.connection.command_timeout(),
    )
    .await;
    supervisor.shutdown_all().await;
    report(result)
}

fn report(result: power::PowerResult) -> Result<()> {
    println!("{}", result.message);
    if let Some(details) = &result.details {
        println!("  {}", details);
    }
    if !result.success {
        bail!("{}", result.message);
    }
    Ok(())
}
