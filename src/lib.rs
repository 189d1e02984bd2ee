//! # Mirage - Interactive SSH Deception Server
//!
//! Mirage accepts SSH connections from the internet, lets attackers log in
//! with guessed credentials and hands them a fabricated Linux shell backed by
//! an in-memory filesystem. Every credential, command and uploaded file is
//! logged; shell sessions can be recorded for replay.
//!
//! ## Features
//!
//! - **Password deception**: configurable accounts, wildcard passwords and an
//!   "accept on the last try" policy that makes brute forcing look real
//! - **Fabricated shell**: line editing, `cd`, `export` and a table of
//!   builtin commands over a seeded virtual filesystem
//! - **File capture**: SCP and SFTP uploads land in the virtual filesystem
//!   and are mirrored to disk
//! - **Port forwarding control**: `direct-tcpip` disabled, remapped or
//!   passed through
//! - **Session recording**: asciicast v2 or UML ttylog
//! - **Admission control**: per-IP connection limits, bandwidth caps and idle
//!   timeouts
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mirage::config::load_config;
//! use mirage::Server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("mirage.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     Server::new(&config)?.listen_and_serve(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Listener -> ConnectionLimiter -> ThrottledStream -> worker -> russh session
//!     -> ChannelDispatcher (per channel) -> Shell | exec | SCP | SFTP | relay
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod helper;
pub mod os;
pub mod recording;
pub mod reputation;
pub mod server;
pub mod services;
pub mod ssh;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{ForwardRejection, MirageError};
pub use server::Server;

/// Version of the Mirage library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
