//! Test utilities for Mirage
//!
//! Starts an in-process server on an ephemeral port and provides a minimal
//! russh client to drive it.

use mirage::config::{Config, UserEntry};
use mirage::recording::SessionLogFormat;
use mirage::transport::ConnectionLimiter;
use mirage::Server;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Test configuration builder
pub struct TestConfigBuilder {
    users: Vec<UserEntry>,
    max_tries: u32,
    allow_retry_login: bool,
    max_conn_per_host: usize,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            users: vec![UserEntry {
                uid: 0,
                gid: 0,
                ..UserEntry::new("root", "123456")
            }],
            max_tries: 3,
            allow_retry_login: true,
            max_conn_per_host: 2,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set password attempts per connection
    pub fn max_tries(mut self, tries: u32) -> Self {
        self.max_tries = tries;
        self
    }

    /// Set the retry policy switch
    pub fn allow_retry_login(mut self, allow: bool) -> Self {
        self.allow_retry_login = allow;
        self
    }

    /// Build the config
    pub fn build(self) -> Config {
        let mut config = Config::default();
        config.server.addr = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.max_connections = 4;
        config.server.max_conn_per_host = self.max_conn_per_host;
        config.server.max_tries = self.max_tries;
        config.server.allow_retry_login = self.allow_retry_login;
        config.server.retry_delay_ms = 10;
        config.server.timeout_secs = 30;
        config.server.session_log_fmt = SessionLogFormat::None;
        config.users = self.users;
        config
    }
}

/// A server running in the background
pub struct TestServer {
    /// Listening address
    pub addr: SocketAddr,
    /// Admission state of the server
    pub limiter: Arc<ConnectionLimiter>,
    _shutdown: broadcast::Sender<bool>,
}

/// Start a server for `config` on 127.0.0.1 with an ephemeral port
pub async fn start_server(config: &Config) -> TestServer {
    let server = Server::new(config).unwrap();
    let limiter = server.limiter();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(server.serve(listener, shutdown_rx));

    TestServer {
        addr,
        limiter,
        _shutdown: shutdown_tx,
    }
}

/// Minimal russh client handler that trusts any host key
pub struct TestClientHandler;

impl client::Handler for TestClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Open an SSH connection to `addr`
pub async fn connect(addr: SocketAddr) -> Handle<TestClientHandler> {
    let config = Arc::new(client::Config::default());
    client::connect(config, addr, TestClientHandler).await.unwrap()
}

/// Connect and log in, asserting success
pub async fn login(addr: SocketAddr, user: &str, password: &str) -> Handle<TestClientHandler> {
    let mut handle = connect(addr).await;
    let auth = handle.authenticate_password(user, password).await.unwrap();
    assert!(auth.success(), "login as {} failed", user);
    handle
}

/// What a channel produced before it closed
#[derive(Debug, Default)]
pub struct ChannelOutcome {
    /// Concatenated channel data
    pub output: String,
    /// Exit status, if one was sent
    pub exit_status: Option<u32>,
    /// Whether the server closed the channel
    pub closed: bool,
}

/// Collect messages from `channel` until it closes or five seconds pass
pub async fn drain(channel: &mut russh::Channel<client::Msg>) -> ChannelOutcome {
    let mut outcome = ChannelOutcome::default();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        match tokio::time::timeout_at(deadline, channel.wait()).await {
            Ok(Some(ChannelMsg::Data { data })) => {
                outcome.output.push_str(&String::from_utf8_lossy(&data));
            }
            Ok(Some(ChannelMsg::ExitStatus { exit_status })) => {
                outcome.exit_status = Some(exit_status);
            }
            Ok(Some(ChannelMsg::Close)) | Ok(None) => {
                outcome.closed = true;
                break;
            }
            Ok(Some(_)) => {}
            Err(_) => break,
        }
    }

    outcome
}

/// Wait until `limiter` shows no live connection from 127.0.0.1
pub async fn wait_for_release(limiter: &ConnectionLimiter) -> bool {
    let local = "127.0.0.1".parse().unwrap();
    for _ in 0..100 {
        if limiter.count(local) == 0 {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
