//! russh `Handler` for one connection
//!
//! Authentication decisions come from [`PasswordChallenge`]. Session
//! channels are handed to a [`ChannelDispatcher`] task each; the callbacks
//! below only translate russh requests into [`ChannelRequest`]s and turn the
//! dispatcher's answer into `channel_success` / `channel_failure`.

use super::auth::{AuthDecision, PasswordChallenge};
use super::channel::{
    ChannelDispatcher, ChannelRequest, DispatchEnv, RequestKind, RusshChannelControl,
    REQUEST_QUEUE_DEPTH,
};
use super::forward::{open_direct, relay};
use super::session::ConnectionInfo;
use super::SshContext;
use crate::config::UserEntry;
use crate::os::context::{ContextSlot, Identity, TermSize};
use crate::reputation::{Behavior, Protocol};
use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Server side of one SSH connection
pub struct HoneypotHandler {
    ctx: Arc<SshContext>,
    info: ConnectionInfo,
    challenge: PasswordChallenge,
    slot: Arc<ContextSlot>,
    channels: HashMap<ChannelId, mpsc::Sender<ChannelRequest>>,
    env: Option<Arc<DispatchEnv>>,
    span: Span,
}

impl HoneypotHandler {
    /// Handler for a connection accepted from `peer`
    pub fn new(ctx: Arc<SshContext>, peer: SocketAddr) -> Self {
        let info = ConnectionInfo::new(peer);
        let span = info_span!(
            "session",
            session_id = %info.session_id,
            src_ip = %info.src_ip(),
            port = info.port(),
        );
        HoneypotHandler {
            challenge: ctx.policy.challenge(),
            ctx,
            info,
            slot: Arc::new(ContextSlot::new()),
            channels: HashMap::new(),
            env: None,
            span,
        }
    }

    /// Connection record
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Span covering this connection
    pub fn span(&self) -> &Span {
        &self.span
    }

    fn login(&mut self, user: UserEntry) {
        let identity = Identity::for_user(&user, &self.ctx.hostname);
        self.env = Some(Arc::new(DispatchEnv {
            fs: self.ctx.fs.clone(),
            commands: self.ctx.commands.clone(),
            recording: self.ctx.recording.clone(),
            delay: self.ctx.delay,
            identity,
            session_id: self.info.session_id.clone(),
            src_ip: self.info.src_ip(),
        }));
        self.info.user = Some(user.name);
    }

    fn report(&self, behavior: Behavior) {
        self.ctx
            .reporter
            .add_category(self.info.peer.ip(), Protocol::Ssh, behavior);
    }

    fn log_public_key(&self, user: &str, key: &PublicKey) {
        info!(
            parent: &self.span,
            user,
            algorithm = key.algorithm().as_str(),
            fingerprint = %key.fingerprint(HashAlg::Sha256),
            "Public key attempt rejected"
        );
    }

    /// Hand `kind` to the channel's dispatcher and answer with its verdict
    async fn forward_request(
        &mut self,
        channel: ChannelId,
        kind: RequestKind,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let ok = match self.channels.get(&channel) {
            Some(requests) => {
                let (request, reply) = ChannelRequest::new(kind);
                if requests.send(request).await.is_err() {
                    false
                } else {
                    reply.await.unwrap_or(false)
                }
            }
            None => {
                debug!(parent: &self.span, channel = ?channel, req_type = kind.name(), "Request for unknown channel");
                false
            }
        };

        if ok {
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }
}

impl Handler for HoneypotHandler {
    type Error = anyhow::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        Ok(self.ctx.banner.clone())
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(parent: &self.span, user, "none auth rejected");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::Password].as_slice())),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        info!(
            parent: &self.span,
            user,
            password,
            src_ip = %self.info.src_ip(),
            port = self.info.port(),
            "Password attempt"
        );

        match self.challenge.decide(user, password) {
            AuthDecision::Accept {
                user: account,
                permit_agent_forwarding,
                deceived,
            } => {
                info!(
                    parent: &self.span,
                    user = %account.name,
                    deceived,
                    permit_agent_forwarding,
                    "Login accepted"
                );
                self.login(account);
                Ok(Auth::Accept)
            }
            AuthDecision::Reject => {
                self.report(Behavior::BruteForce);
                tokio::time::sleep(self.ctx.policy.retry_delay()).await;
                Ok(Auth::reject())
            }
        }
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.log_public_key(user, public_key);
        Ok(Auth::reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.log_public_key(user, public_key);
        Ok(Auth::reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let env = match &self.env {
            Some(env) => env.clone(),
            None => return Ok(false),
        };

        if self.info.client_version.is_none() {
            let version = String::from_utf8_lossy(session.remote_sshid()).to_string();
            info!(parent: &self.span, client_version = %version, "Client identified");
            self.info.client_version = Some(version);
        }

        let id = channel.id();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let dispatcher = ChannelDispatcher::new(
            id.into(),
            requests_rx,
            channel.into_stream(),
            RusshChannelControl::new(session.handle(), id),
            self.slot.clone(),
            env,
        );
        tokio::spawn(
            async move {
                dispatcher.run().await;
            }
            .instrument(self.span.clone()),
        );
        self.channels.insert(id, requests_tx);

        debug!(parent: &self.span, channel = ?id, "Session channel opened");
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            parent: &self.span,
            host = host_to_connect,
            port = port_to_connect,
            originator = %format!("{}:{}", originator_address, originator_port),
            "direct-tcpip request"
        );
        self.report(Behavior::Proxying);

        match open_direct(
            &self.ctx.redirect,
            self.ctx.dialer.as_ref(),
            host_to_connect,
            port_to_connect,
        )
        .await
        {
            Ok((target, upstream)) => {
                let stream = channel.into_stream();
                tokio::spawn(
                    async move {
                        let (up, down) = relay(stream, upstream).await;
                        info!(target = %target, bytes_up = up, bytes_down = down, "Forwarding finished");
                    }
                    .instrument(self.span.clone()),
                );
                Ok(true)
            }
            Err(rejection) => {
                warn!(parent: &self.span, reason = %rejection, "direct-tcpip rejected");
                Ok(false)
            }
        }
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            parent: &self.span,
            host = host_to_connect,
            port = port_to_connect,
            "forwarded-tcpip rejected"
        );
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(parent: &self.span, address, port = *port, "tcpip-forward refused");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(parent: &self.span, address, port, "cancel-tcpip-forward refused");
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::PtyReq {
            term: term.to_string(),
            size: TermSize::new(col_width, row_height),
        };
        self.forward_request(channel, kind, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = RequestKind::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.forward_request(channel, kind, session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, RequestKind::Shell, session)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, RequestKind::Exec(data.to_vec()), session)
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, RequestKind::Subsystem(name.to_string()), session)
            .await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(requests) = self.channels.get(&channel) {
            let kind = RequestKind::WindowChange(TermSize::new(col_width, row_height));
            let _ = requests.send(ChannelRequest::unanswered(kind)).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(parent: &self.span, channel = ?channel, "Channel EOF");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(parent: &self.span, channel = ?channel, "Channel closed");
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for HoneypotHandler {
    fn drop(&mut self) {
        info!(
            parent: &self.span,
            user = self.info.user.as_deref().unwrap_or("-"),
            client_version = self.info.client_version.as_deref().unwrap_or("-"),
            "Session closed"
        );
    }
}
