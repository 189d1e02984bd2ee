//! Server configuration types
//!
//! Defines the `[server]` and `[virtualfs]` sections of the configuration.

use crate::recording::SessionLogFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_hostname() -> String {
    "svr04".to_string()
}

fn default_ident() -> String {
    "SSH-2.0-OpenSSH_7.4p1 Debian-10+deb9u7".to_string()
}

fn default_max_connections() -> usize {
    10
}

fn default_max_conn_per_host() -> usize {
    2
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_tries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_session_log_dir() -> PathBuf {
    PathBuf::from("logs/sessions")
}

fn default_max_stored_mb() -> usize {
    256
}

/// Policy for `direct-tcpip` channel destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PortRedirectionMode {
    /// Reject every forwarding request
    #[default]
    Disable,
    /// Look the requested port up in `port_redirection_map`
    Map,
    /// Dial the requested host and port verbatim
    Direct,
}

/// Listener, authentication and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host name presented by the fabricated system
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// SSH identification string sent to clients
    #[serde(default = "default_ident")]
    pub ident: String,

    /// Number of session workers (concurrent SSH sessions)
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Live connections allowed per source IP (0 = unlimited)
    #[serde(default = "default_max_conn_per_host")]
    pub max_conn_per_host: usize,

    /// Aggregate bytes/second per connection (0 = unlimited)
    #[serde(default)]
    pub speed: u64,

    /// Idle timeout in seconds (0 = never)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Password attempts per connection
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    /// Accept any username through the deception branch
    #[serde(default)]
    pub allow_random_user: bool,

    /// Make attackers fail until their last try before accepting
    #[serde(default = "default_true")]
    pub allow_retry_login: bool,

    /// Delay before a password rejection, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Base delay before each shell command, in milliseconds (0 = none)
    #[serde(default)]
    pub process_delay_ms: u64,

    /// Path to the pre-authentication banner
    #[serde(default)]
    pub banner: Option<PathBuf>,

    /// Path to the host key (OpenSSH format); generated when absent
    #[serde(default)]
    pub host_key: Option<PathBuf>,

    /// Policy for `direct-tcpip` channels
    #[serde(default)]
    pub port_redirection: PortRedirectionMode,

    /// Port to `host:port` table used by the `map` policy
    #[serde(default)]
    pub port_redirection_map: HashMap<String, String>,

    /// Session recording format
    #[serde(default)]
    pub session_log_fmt: SessionLogFormat,

    /// Directory receiving session recordings
    #[serde(default = "default_session_log_dir")]
    pub session_log_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            addr: default_addr(),
            port: default_port(),
            hostname: default_hostname(),
            ident: default_ident(),
            max_connections: default_max_connections(),
            max_conn_per_host: default_max_conn_per_host(),
            speed: 0,
            timeout_secs: default_timeout_secs(),
            max_tries: default_max_tries(),
            allow_random_user: false,
            allow_retry_login: true,
            retry_delay_ms: default_retry_delay_ms(),
            process_delay_ms: 0,
            banner: None,
            host_key: None,
            port_redirection: PortRedirectionMode::default(),
            port_redirection_map: HashMap::new(),
            session_log_fmt: SessionLogFormat::default(),
            session_log_dir: default_session_log_dir(),
        }
    }
}

impl ServerConfig {
    /// The `addr:port` pair the listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }

    /// Validate the server section
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be greater than zero".to_string());
        }
        if self.max_tries == 0 {
            return Err("max_tries must be greater than zero".to_string());
        }
        if !self.ident.starts_with("SSH-2.0-") {
            return Err(format!("ident must start with SSH-2.0-: {}", self.ident));
        }
        for (port, target) in &self.port_redirection_map {
            if port.parse::<u32>().is_err() {
                return Err(format!("port_redirection_map key is not a port: {}", port));
            }
            if target.is_empty() {
                return Err(format!("port_redirection_map entry {} is empty", port));
            }
        }
        Ok(())
    }
}

/// Virtual filesystem settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualFsConfig {
    /// Directory on disk where uploaded files are mirrored
    #[serde(default)]
    pub saved_file_dir: Option<PathBuf>,

    /// Cap on file contents held in memory, in MiB
    #[serde(default = "default_max_stored_mb")]
    pub max_stored_mb: usize,
}

impl Default for VirtualFsConfig {
    fn default() -> Self {
        VirtualFsConfig {
            saved_file_dir: None,
            max_stored_mb: default_max_stored_mb(),
        }
    }
}

impl VirtualFsConfig {
    /// The in-memory cap in bytes
    pub fn byte_budget(&self) -> usize {
        self.max_stored_mb.saturating_mul(1024 * 1024)
    }
}
