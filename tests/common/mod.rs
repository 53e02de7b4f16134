//! In-process SSH server used by the integration tests.
//!
//! Accepts password auth, answers `exec` with a tiny command interpreter and
//! serves a PTY shell that echoes input and understands `ls`, `echo` and
//! `exit`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use shellcore::models::{ConnectionSettings, ServerProfile};
use shellcore::ssh::{KnownHosts, SessionEvent, SessionId, SessionRegistry, SessionSupervisor};

pub const USER: &str = "root";
pub const PASSWORD: &str = "secret";
pub const HOSTNAME: &str = "testhost";
pub const LISTING: &str = "Desktop\r\nDocuments\r\nnotes.txt\r\n";

const PROMPT: &str = "$ ";

/// Upper bound for any wait in the tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct ServerState {
    refuse_pty: AtomicBool,
    stall_pty: AtomicBool,
    connections: AtomicUsize,
    drop_token: Mutex<CancellationToken>,
}

/// Running test server, stopped on drop
pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let key = russh::keys::PrivateKey::random(
            &mut russh::keys::ssh_key::rand_core::OsRng,
            russh::keys::ssh_key::Algorithm::Ed25519,
        )
        .expect("generate host key");
        let config = Arc::new(russh::server::Config {
            keys: vec![key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            inactivity_timeout: None,
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState {
            refuse_pty: AtomicBool::new(false),
            stall_pty: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            drop_token: Mutex::new(CancellationToken::new()),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let drop_token = accept_state.drop_token.lock().unwrap().clone();
                let handler = TestHandler {
                    state: accept_state.clone(),
                    ptys: HashMap::new(),
                    shells: HashMap::new(),
                };
                let config = config.clone();

                // The SSH session runs on one end of an in-memory pipe so the
                // TCP side can be cut independently of russh.
                let (server_side, mut relay_side) = tokio::io::duplex(64 * 1024);
                tokio::spawn(async move {
                    if let Ok(running) = russh::server::run_stream(config, server_side, handler).await {
                        let _ = running.await;
                    }
                });
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::io::copy_bidirectional(&mut tcp, &mut relay_side) => {}
                        _ = drop_token.cancelled() => {}
                    }
                });
            }
        });

        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Profile with the right credentials
    pub fn profile(&self) -> ServerProfile {
        ServerProfile::with_password("test-server", "127.0.0.1", self.port(), USER, PASSWORD)
    }

    pub fn profile_with_password(&self, password: &str) -> ServerProfile {
        ServerProfile::with_password("test-server", "127.0.0.1", self.port(), USER, password)
    }

    /// Make subsequent PTY requests fail
    pub fn refuse_pty(&self, refuse: bool) {
        self.state.refuse_pty.store(refuse, Ordering::SeqCst);
    }

    /// Leave subsequent PTY requests unanswered
    pub fn stall_pty(&self, stall: bool) {
        self.state.stall_pty.store(stall, Ordering::SeqCst);
    }

    /// Cut every established TCP connection without an SSH disconnect
    pub fn drop_connections(&self) {
        let mut token = self.state.drop_token.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
        self.state.drop_token.lock().unwrap().cancel();
    }
}

struct ShellPty {
    cols: u32,
    line: Vec<u8>,
}

struct TestHandler {
    state: Arc<ServerState>,
    ptys: HashMap<ChannelId, u32>,
    shells: HashMap<ChannelId, ShellPty>,
}

fn send(session: &mut Session, channel: ChannelId, text: &str) -> Result<(), russh::Error> {
    session.data(channel, CryptoVec::from_slice(text.as_bytes()))
}

fn finish(session: &mut Session, channel: ChannelId, status: u32) -> Result<(), russh::Error> {
    session.exit_status_request(channel, status)?;
    session.eof(channel)?;
    session.close(channel)
}

impl TestHandler {
    fn run_exec(
        &mut self,
        channel: ChannelId,
        command: &str,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or_default();
        let rest: Vec<&str> = words.collect();

        match program {
            "forbidden" => {
                session.channel_failure(channel)?;
                session.close(channel)
            }
            "sleep" => {
                session.channel_success(channel)?;
                let secs: u64 = rest.first().and_then(|s| s.parse().ok()).unwrap_or(1);
                let handle = session.handle();
                tokio::spawn(async move {
                    let _ = handle
                        .data(channel, CryptoVec::from_slice(b"partial output\n"))
                        .await;
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    let _ = handle.exit_status_request(channel, 0).await;
                    let _ = handle.eof(channel).await;
                    let _ = handle.close(channel).await;
                });
                Ok(())
            }
            _ => {
                session.channel_success(channel)?;
                match program {
                    "echo" if rest.last() == Some(&">&2") => {
                        let text = rest[..rest.len() - 1].join(" ");
                        session.extended_data(
                            channel,
                            1,
                            CryptoVec::from_slice(format!("{}\n", text).as_bytes()),
                        )?;
                        finish(session, channel, 0)
                    }
                    "echo" => {
                        send(session, channel, &format!("{}\n", rest.join(" ")))?;
                        finish(session, channel, 0)
                    }
                    "whoami" => {
                        send(session, channel, &format!("{}\n", USER))?;
                        finish(session, channel, 0)
                    }
                    "hostname" => {
                        send(session, channel, &format!("{}\n", HOSTNAME))?;
                        finish(session, channel, 0)
                    }
                    "true" => finish(session, channel, 0),
                    "false" => finish(session, channel, 1),
                    "exit" => {
                        let code = rest.first().and_then(|s| s.parse().ok()).unwrap_or(0);
                        finish(session, channel, code)
                    }
                    other => {
                        session.extended_data(
                            channel,
                            1,
                            CryptoVec::from_slice(
                                format!("sh: {}: command not found\n", other).as_bytes(),
                            ),
                        )?;
                        finish(session, channel, 127)
                    }
                }
            }
        }
    }

    fn run_shell_line(
        &mut self,
        channel: ChannelId,
        line: &str,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        let cols = self.shells.get(&channel).map(|s| s.cols).unwrap_or(80);
        let line = line.trim();
        match line {
            "" => {}
            "ls" => send(session, channel, LISTING)?,
            "echo $COLUMNS" => send(session, channel, &format!("{}\r\n", cols))?,
            "exit" => {
                self.shells.remove(&channel);
                return finish(session, channel, 0);
            }
            _ if line.starts_with("echo ") => {
                send(session, channel, &format!("{}\r\n", &line["echo ".len()..]))?
            }
            other => send(session, channel, &format!("sh: {}: command not found\r\n", other))?,
        }
        send(session, channel, PROMPT)
    }
}

impl Handler for TestHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.state.refuse_pty.load(Ordering::SeqCst) {
            return session.channel_failure(channel);
        }
        if self.state.stall_pty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.ptys.insert(channel, col_width);
        session.channel_success(channel)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(cols) = self.ptys.remove(&channel) else {
            return session.channel_failure(channel);
        };
        session.channel_success(channel)?;
        self.shells.insert(
            channel,
            ShellPty {
                cols,
                line: Vec::new(),
            },
        );
        send(session, channel, &format!("Welcome to {}\r\n{}", HOSTNAME, PROMPT))
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        self.run_exec(channel, &command, session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = self.shells.get_mut(&channel) {
            shell.cols = col_width;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut lines = Vec::new();
        {
            let Some(shell) = self.shells.get_mut(&channel) else {
                return Ok(());
            };
            for byte in data {
                match byte {
                    b'\r' | b'\n' => lines.push(String::from_utf8_lossy(&std::mem::take(&mut shell.line)).to_string()),
                    other => shell.line.push(*other),
                }
            }
        }

        // Terminal echo
        let echoed: Vec<u8> = data
            .iter()
            .flat_map(|b| match b {
                b'\r' | b'\n' => b"\r\n".to_vec(),
                other => vec![*other],
            })
            .collect();
        session.data(channel, CryptoVec::from_slice(&echoed))?;

        for line in lines {
            if !self.shells.contains_key(&channel) {
                break;
            }
            self.run_shell_line(channel, &line, session)?;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.shells.remove(&channel).is_some() {
            return finish(session, channel, 0);
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.shells.remove(&channel);
        self.ptys.remove(&channel);
        Ok(())
    }
}

/// Settings tuned for tests
pub fn test_settings() -> ConnectionSettings {
    ConnectionSettings {
        connection_timeout_secs: 5,
        keepalive_interval_secs: 0,
        command_timeout_secs: 5,
        liveness_timeout_secs: 1,
        reconnect_attempts: 2,
        reconnect_interval_secs: 0,
        reconnect_max_interval_secs: 0,
        teardown_timeout_secs: 2,
        ..Default::default()
    }
}

pub fn supervisor_with(
    settings: ConnectionSettings,
) -> (Arc<SessionSupervisor>, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
    let (supervisor, events) = SessionSupervisor::new(
        Arc::new(SessionRegistry::new()),
        Arc::new(KnownHosts::in_memory()),
        settings,
    );
    (Arc::new(supervisor), events)
}

pub fn supervisor() -> (Arc<SessionSupervisor>, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) {
    supervisor_with(test_settings())
}

/// Poll `read_shell` until the collected output contains `needle`
pub async fn read_until(supervisor: &SessionSupervisor, id: &SessionId, needle: &str) -> String {
    let mut collected = Vec::new();
    let found = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let chunk = supervisor.read_shell(id).await.expect("read_shell");
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains(needle) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    let text = String::from_utf8_lossy(&collected).to_string();
    assert!(found.is_ok(), "timed out waiting for {:?}, got {:?}", needle, text);
    text
}

/// Drain events received so far
pub fn drain_events(events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
