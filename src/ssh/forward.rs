//! `direct-tcpip` forwarding
//!
//! A forwarding request is resolved against the configured
//! [`PortRedirection`], dialled through a [`Dialer`] and, once both ends
//! exist, relayed by [`relay`].

pub use crate::error::ForwardRejection;

use crate::config::PortRedirectionMode;
use crate::helper::DEFAULT_CONNECT_TIMEOUT_SECS;
use crate::transport::SocketOpts;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Any bidirectional byte stream a dialer can hand back
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Debug> StreamDyn for T {}

/// A dialled stream
pub type BoxedStream = Box<dyn StreamDyn>;

/// Destination policy for `direct-tcpip`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRedirection {
    /// Refuse every request
    Disable,
    /// Send the requested port to a fixed `host:port`
    Map(HashMap<u32, String>),
    /// Dial what the client asked for
    Direct,
}

impl PortRedirection {
    /// Build the policy from the `[server]` settings
    pub fn from_config(mode: PortRedirectionMode, map: &HashMap<String, String>) -> Self {
        match mode {
            PortRedirectionMode::Disable => PortRedirection::Disable,
            PortRedirectionMode::Direct => PortRedirection::Direct,
            PortRedirectionMode::Map => {
                let mut ports = HashMap::with_capacity(map.len());
                for (port, target) in map {
                    match port.parse::<u32>() {
                        Ok(port) => {
                            ports.insert(port, target.clone());
                        }
                        Err(_) => warn!(port = %port, "Ignoring non-numeric redirection entry"),
                    }
                }
                PortRedirection::Map(ports)
            }
        }
    }

    /// Address to dial for a request to `host:port`
    pub fn resolve(&self, host: &str, port: u32) -> Result<String, ForwardRejection> {
        match self {
            PortRedirection::Disable => Err(ForwardRejection::Prohibited),
            PortRedirection::Map(ports) => ports
                .get(&port)
                .cloned()
                .ok_or(ForwardRejection::Unmapped(port)),
            PortRedirection::Direct => Ok(join_host_port(host, port)),
        }
    }
}

fn join_host_port(host: &str, port: u32) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Opens outbound connections for forwarded channels
#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    /// Connect to `addr` (`host:port`)
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Plain TCP dialer with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    socket_opts: SocketOpts,
}

impl Default for TcpDialer {
    fn default() -> Self {
        TcpDialer::new(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
    }
}

impl TcpDialer {
    /// Dialer giving up after `connect_timeout`
    pub fn new(connect_timeout: Duration) -> Self {
        TcpDialer {
            connect_timeout,
            socket_opts: SocketOpts::for_relay(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        self.socket_opts.apply(&stream)?;
        Ok(Box::new(stream))
    }
}

/// Resolve a `direct-tcpip` request and dial it
///
/// Nothing is dialled unless the policy yields a destination.
pub async fn open_direct(
    redirect: &PortRedirection,
    dialer: &dyn Dialer,
    host: &str,
    port: u32,
) -> Result<(String, BoxedStream), ForwardRejection> {
    let target = redirect.resolve(host, port)?;
    match dialer.dial(&target).await {
        Ok(stream) => Ok((target, stream)),
        Err(e) => {
            debug!(target = %target, error = %e, "Dial failed");
            Err(ForwardRejection::ConnectionFailed(target))
        }
    }
}

/// Copy bytes both ways until both sides close
///
/// Each direction runs in its own task. A direction that reaches EOF shuts
/// down the opposite write half, so a client half-close still lets the reply
/// through. Returns the bytes moved `(a -> b, b -> a)`.
pub async fn relay<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let a_to_b = tokio::spawn(relay_one_direction(a_read, b_write, "a->b"));
    let b_to_a = tokio::spawn(relay_one_direction(b_read, a_write, "b->a"));

    let (up, down) = tokio::join!(a_to_b, b_to_a);
    (up.unwrap_or(0), down.unwrap_or(0))
}

async fn relay_one_direction<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(direction, error = %e, "Relay direction failed");
            0
        }
    };
    let _ = writer.shutdown().await;
    bytes
}
