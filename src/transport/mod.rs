//! Transport module for Mirage
//!
//! Admission control and stream shaping for accepted sockets: the per-IP
//! [`ConnectionLimiter`], the bandwidth/idle [`ThrottledStream`], and the
//! socket options applied to every accepted connection.

mod limiter;
mod throttle;

pub use limiter::{AdmissionGuard, ConnectionLimiter};
pub use throttle::ThrottledStream;

use std::time::Duration;
use tokio::net::TcpStream;

/// Socket options for configuring connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options for sockets accepted from attackers (interactive traffic)
    pub fn for_accepted() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(60),
            keepalive_interval: Some(15),
        }
    }

    /// Options for relay connections dialled on behalf of `direct-tcpip`
    pub fn for_relay() -> Self {
        SocketOpts::default()
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_opts_default() {
        let opts = SocketOpts::default();
        assert!(opts.nodelay);
        assert_eq!(opts.keepalive_secs, Some(20));
        assert_eq!(opts.keepalive_interval, Some(8));
    }

    #[test]
    fn test_socket_opts_for_accepted() {
        let opts = SocketOpts::for_accepted();
        assert!(opts.nodelay);
        assert_eq!(opts.keepalive_secs, Some(60));
    }

    #[tokio::test]
    async fn test_apply_to_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();

        SocketOpts::for_accepted().apply(&client).unwrap();
        assert!(client.nodelay().unwrap());
    }
}
