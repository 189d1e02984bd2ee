//! Per-connection record

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes of the digest kept in the identifier
const SESSION_ID_BYTES: usize = 12;

/// What the server knows about one connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote address
    pub peer: SocketAddr,
    /// Unique session identifier
    pub session_id: String,
    /// Client identification string, once the handshake has shown it
    pub client_version: Option<String>,
    /// Authenticated user name
    pub user: Option<String>,
}

impl ConnectionInfo {
    /// Record for a connection accepted from `peer` just now
    pub fn new(peer: SocketAddr) -> Self {
        ConnectionInfo {
            peer,
            session_id: derive_session_id(peer),
            client_version: None,
            user: None,
        }
    }

    /// Source address as text
    pub fn src_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    /// Source port
    pub fn port(&self) -> u16 {
        self.peer.port()
    }
}

/// Derive a session identifier from the peer, the current instant and a
/// random salt
pub fn derive_session_id(peer: SocketAddr) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let salt: [u8; 16] = rand::random();

    let mut hasher = Sha256::new();
    hasher.update(peer.to_string().as_bytes());
    hasher.update(nanos.to_be_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();

    URL_SAFE_NO_PAD.encode(&digest[..SESSION_ID_BYTES])
}
