//! Error types for Mirage
//!
//! This module defines the custom error types used throughout the server.

use std::io;
use thiserror::Error;

/// Main error type for Mirage operations
#[derive(Error, Debug)]
pub enum MirageError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol error (malformed request payload, duplicate terminal mode)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Port forwarding rejection
    #[error("Forwarding rejected: {0}")]
    Forwarding(#[from] ForwardRejection),
}

/// Reasons a `direct-tcpip` or `forwarded-tcpip` channel is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwardRejection {
    /// Forwarding is administratively disabled
    #[error("port forwarding disabled")]
    Prohibited,

    /// The requested port has no entry in the redirection map
    #[error("port {0} is not mapped")]
    Unmapped(u32),

    /// The destination could not be dialled
    #[error("connection to {0} failed")]
    ConnectionFailed(String),
}
