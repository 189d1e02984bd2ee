//! SSH front end
//!
//! [`run_session`] drives one accepted connection through russh with a
//! [`HoneypotHandler`]. Everything the handler needs from the server lives
//! in [`SshContext`], built once at startup and shared by every session.

pub mod auth;
pub mod channel;
pub mod forward;
pub mod handler;
pub mod keys;
pub mod session;

pub use auth::{AuthDecision, PasswordChallenge, PasswordPolicy, RetryPolicy, UserTable};
pub use channel::{ChannelDispatcher, ChannelRequest, QuitSignal, RequestKind};
pub use forward::{Dialer, PortRedirection, TcpDialer};
pub use handler::HoneypotHandler;
pub use session::ConnectionInfo;

use crate::config::ServerConfig;
use crate::os::command::CommandTable;
use crate::os::fs::VirtualFs;
use crate::os::shell::ProcessDelay;
use crate::recording::RecordingConfig;
use crate::reputation::ReputationReporter;
use anyhow::Result;
use russh::keys::PrivateKey;
use russh::server::Config as RusshConfig;
use russh::{MethodKind, MethodSet, SshId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, Instrument};

/// Server-wide state shared by all sessions
#[derive(Debug)]
pub struct SshContext {
    /// Host name of the fabricated system
    pub hostname: String,
    /// Password policy
    pub policy: Arc<PasswordPolicy>,
    /// Shared filesystem
    pub fs: Arc<dyn VirtualFs>,
    /// Shared command table
    pub commands: Arc<CommandTable>,
    /// `direct-tcpip` policy
    pub redirect: PortRedirection,
    /// Outbound connector for forwarded channels
    pub dialer: Arc<dyn Dialer>,
    /// Session recording settings
    pub recording: RecordingConfig,
    /// Pre-authentication banner
    pub banner: Option<String>,
    /// Per-command delay in the shell
    pub delay: ProcessDelay,
    /// Reputation sink
    pub reporter: Arc<dyn ReputationReporter>,
}

/// Build the russh server configuration
///
/// Rejection delays are applied by the handler itself, so russh's own are
/// zero. One authentication attempt on top of `max_tries` is left for the
/// client's initial `none` probe.
pub fn build_russh_config(config: &ServerConfig, host_key: PrivateKey) -> RusshConfig {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);

    let inactivity_timeout =
        (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));

    RusshConfig {
        server_id: SshId::Standard(config.ident.clone()),
        methods,
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key],
        max_auth_attempts: config.max_tries as usize + 1,
        inactivity_timeout,
        ..Default::default()
    }
}

/// Run one SSH session on `stream` until the transport closes
pub async fn run_session<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<SshContext>,
    config: Arc<RusshConfig>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handler = HoneypotHandler::new(ctx, peer);
    let span = handler.span().clone();

    async move {
        info!("Session started");
        let session = russh::server::run_stream(config, stream, handler).await?;
        session.await?;
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}
