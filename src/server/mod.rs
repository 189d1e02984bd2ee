//! Listener and worker pool
//!
//! The accept loop admits each socket through the per-IP
//! [`ConnectionLimiter`] and hands it to a fixed pool of workers over a
//! bounded queue, so accepting pauses while every worker is busy. A worker
//! shapes the socket with [`ThrottledStream`] and runs one SSH session on it.

use crate::config::{Config, ServerConfig};
use crate::os::command::CommandTable;
use crate::os::fs::MemoryFs;
use crate::os::shell::ProcessDelay;
use crate::recording::RecordingConfig;
use crate::reputation::{Behavior, LogReporter, Protocol};
use crate::ssh::{self, keys, PasswordPolicy, PortRedirection, SshContext, TcpDialer};
use crate::transport::{AdmissionGuard, ConnectionLimiter, SocketOpts, ThrottledStream};
use anyhow::{Context, Result};
use russh::keys::PrivateKey;
use russh::server::Config as RusshConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// An admitted connection waiting for a worker
struct Job {
    stream: TcpStream,
    peer: SocketAddr,
    guard: AdmissionGuard,
}

/// State every worker shares
struct Shared {
    ctx: Arc<SshContext>,
    russh: Arc<RusshConfig>,
    speed: u64,
    idle_timeout: Duration,
}

impl Shared {
    async fn handle(&self, job: Job) {
        let Job {
            stream,
            peer,
            guard,
        } = job;
        let ip = peer.ip();

        if let Err(e) = SocketOpts::for_accepted().apply(&stream) {
            debug!(src_ip = %ip, error = %e, "Failed to set socket options");
        }
        let stream = ThrottledStream::new(stream, self.speed, self.idle_timeout);

        let reporter = &self.ctx.reporter;
        reporter.create_profile(ip);
        reporter.add_category(ip, Protocol::Ssh, Behavior::Hacking);

        if let Err(e) = ssh::run_session(stream, peer, self.ctx.clone(), self.russh.clone()).await
        {
            error!(src_ip = %ip, port = peer.port(), error = %e, "Session ended with error");
        }

        reporter.upload_report(ip);
        drop(guard);
    }
}

/// The SSH deception server
pub struct Server {
    bind_addr: String,
    workers: usize,
    limiter: Arc<ConnectionLimiter>,
    shared: Arc<Shared>,
}

impl Server {
    /// Build a server from configuration
    ///
    /// Loads (or generates) the host key and the banner, seeds the virtual
    /// filesystem and registers the builtin commands.
    pub fn new(config: &Config) -> Result<Self> {
        let server = &config.server;

        let host_key = keys::load_or_generate(server.host_key.as_deref())?;
        info!(fingerprint = %keys::key_fingerprint(&host_key), "Host key ready");

        let banner = match &server.banner {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Banner unreadable, continuing without");
                    None
                }
            },
            None => None,
        };

        let mut fs = MemoryFs::seeded(&server.hostname, &config.users)
            .with_byte_budget(config.virtualfs.byte_budget());
        if let Some(dir) = &config.virtualfs.saved_file_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create capture directory {:?}", dir))?;
            fs = fs.with_capture_dir(dir.clone());
        }

        let ctx = SshContext {
            hostname: server.hostname.clone(),
            policy: Arc::new(PasswordPolicy::from_config(server, &config.users)),
            fs: Arc::new(fs),
            commands: Arc::new(CommandTable::with_builtins()),
            redirect: PortRedirection::from_config(
                server.port_redirection,
                &server.port_redirection_map,
            ),
            dialer: Arc::new(TcpDialer::default()),
            recording: RecordingConfig {
                format: server.session_log_fmt,
                dir: server.session_log_dir.clone(),
            },
            banner,
            delay: ProcessDelay::new(server.process_delay_ms),
            reporter: Arc::new(LogReporter::new()),
        };

        Ok(Self::with_context(server, ctx, host_key))
    }

    /// Build a server around an already assembled session context
    pub fn with_context(server: &ServerConfig, ctx: SshContext, host_key: PrivateKey) -> Self {
        Server {
            bind_addr: server.bind_addr(),
            workers: server.max_connections.max(1),
            limiter: Arc::new(ConnectionLimiter::new(server.max_conn_per_host)),
            shared: Arc::new(Shared {
                ctx: Arc::new(ctx),
                russh: Arc::new(ssh::build_russh_config(server, host_key)),
                speed: server.speed,
                idle_timeout: Duration::from_secs(server.timeout_secs),
            }),
        }
    }

    /// Per-IP admission state
    pub fn limiter(&self) -> Arc<ConnectionLimiter> {
        self.limiter.clone()
    }

    /// Bind the configured address and serve until shutdown
    pub async fn listen_and_serve(self, shutdown: broadcast::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from `listener` until `shutdown` fires
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<bool>,
    ) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            workers = self.workers,
            max_conn_per_host = self.limiter.max_per_host(),
            "Listening"
        );

        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(1);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let jobs = jobs_rx.clone();
            let shared = self.shared.clone();
            workers.spawn(async move {
                loop {
                    let job = jobs.lock().await.recv().await;
                    match job {
                        Some(job) => shared.handle(job).await,
                        None => break,
                    }
                }
                debug!(worker, "Worker stopped");
            });
        }

        loop {
            let (stream, peer) = tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!(error = %e, "Accept error");
                            continue;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down, no new connections");
                    break;
                }
            };

            let Some(guard) = self.limiter.admit(peer.ip()) else {
                warn!(src_ip = %peer.ip(), port = peer.port(), "Per-host limit reached, dropping connection");
                continue;
            };
            debug!(src_ip = %peer.ip(), port = peer.port(), "Connection admitted");

            let job = Job {
                stream,
                peer,
                guard,
            };
            tokio::select! {
                sent = jobs_tx.send(job) => {
                    if sent.is_err() {
                        error!("Worker pool gone");
                        break;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down, no new connections");
                    break;
                }
            }
        }

        drop(jobs_tx);
        workers.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::SessionLogFormat;
    use std::net::IpAddr;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn config(max_conn_per_host: usize) -> Config {
        let mut config = Config::default();
        config.server.addr = "127.0.0.1".into();
        config.server.port = 0;
        config.server.max_connections = 2;
        config.server.max_conn_per_host = max_conn_per_host;
        config.server.session_log_fmt = SessionLogFormat::None;
        config
    }

    async fn start(config: &Config) -> (SocketAddr, Arc<ConnectionLimiter>, broadcast::Sender<bool>) {
        let server = Server::new(config).unwrap();
        let limiter = server.limiter();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        tokio::spawn(server.serve(listener, rx));
        (addr, limiter, tx)
    }

    #[tokio::test]
    async fn test_sends_identification() {
        let config = config(2);
        let (addr, _limiter, _tx) = start(&config).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        assert!(line.starts_with(&config.server.ident));
    }

    #[tokio::test]
    async fn test_per_host_limit_drops_extra_connection() {
        let (addr, limiter, _tx) = start(&config(1)).await;

        let first = TcpStream::connect(addr).await.unwrap();
        let mut first = BufReader::new(first);
        let mut line = String::new();
        first.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("SSH-2.0-"));

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let local: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(limiter.count(local), 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_releases_host() {
        let (addr, limiter, _tx) = start(&config(1)).await;
        let local: IpAddr = "127.0.0.1".parse().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(1), stream.read_to_end(&mut buf)).await;
        drop(stream);

        let mut released = false;
        for _ in 0..100 {
            if limiter.count(local) == 0 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(released);

        // the slot is reusable
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).await.unwrap();
        assert!(line.starts_with("SSH-2.0-"));
        assert_eq!(limiter.count(local), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_serving() {
        let server = Server::new(&config(2)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = broadcast::channel(1);
        let serving = tokio::spawn(server.serve(listener, rx));

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_new_reports_bad_capture_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let mut config = config(2);
        config.virtualfs.saved_file_dir = Some(blocker.join("captured"));
        assert!(Server::new(&config).is_err());
    }
}
