//! Per-channel request dispatcher
//!
//! Each `session` channel gets a [`ChannelDispatcher`] running in its own
//! task. The russh handler turns channel requests into [`ChannelRequest`]s
//! and sends them here in arrival order; each request carries a
//! [`RequestReply`] that the handler awaits before answering the client, so
//! replies stay ordered per channel.
//!
//! The first granted `shell`, `exec` or `subsystem` request moves the
//! channel's byte stream and the [`QuitSignal`] into a leaf service. When the
//! leaf finishes, the dispatcher sends `exit-status` and closes the channel.

use crate::os::command::CommandTable;
use crate::os::context::{ContextHandle, ContextSlot, Identity, TermSize, VirtualContext};
use crate::os::fs::VirtualFs;
use crate::os::shell::{ProcessDelay, Shell};
use crate::os::terminal::Terminal;
use crate::recording::{RecordingConfig, SessionMeta};
use crate::services::{self, spawn_leaf, ScpMode, ScpService, SftpServer};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Exit status reported when a leaf ends without a code
pub const EXIT_ABNORMAL: i32 = 1;

/// Depth of the per-channel request queue
pub const REQUEST_QUEUE_DEPTH: usize = 16;

/// Write end of a channel's termination signal; consumed on send
#[derive(Debug)]
pub struct QuitSignal(oneshot::Sender<i32>);

/// Read end of a channel's termination signal
///
/// Resolves to the sent exit code, or to [`EXIT_ABNORMAL`] if the sender was
/// dropped without sending.
#[derive(Debug)]
pub struct QuitReceiver(oneshot::Receiver<i32>);

impl QuitSignal {
    /// Create a connected signal pair
    pub fn new() -> (QuitSignal, QuitReceiver) {
        let (tx, rx) = oneshot::channel();
        (QuitSignal(tx), QuitReceiver(rx))
    }

    /// Deliver the exit code
    pub fn send(self, code: i32) {
        let _ = self.0.send(code);
    }
}

impl Future for QuitReceiver {
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(EXIT_ABNORMAL))
    }
}

/// A channel request as the dispatcher sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `pty-req`
    PtyReq {
        /// Terminal type (`TERM`)
        term: String,
        /// Geometry
        size: TermSize,
    },
    /// `env`
    Env {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// `shell`
    Shell,
    /// `exec`; the raw command bytes
    Exec(Vec<u8>),
    /// `subsystem`
    Subsystem(String),
    /// `window-change`
    WindowChange(TermSize),
    /// PuTTY keep-alive style requests that are acknowledged and ignored
    VendorNoop(String),
    /// Anything else
    Unknown(String),
}

impl RequestKind {
    /// Wire name of the request
    pub fn name(&self) -> &str {
        match self {
            RequestKind::PtyReq { .. } => "pty-req",
            RequestKind::Env { .. } => "env",
            RequestKind::Shell => "shell",
            RequestKind::Exec(_) => "exec",
            RequestKind::Subsystem(_) => "subsystem",
            RequestKind::WindowChange(_) => "window-change",
            RequestKind::VendorNoop(name) | RequestKind::Unknown(name) => name,
        }
    }

    /// Classify a request by its wire name when no typed payload applies
    pub fn other(name: &str) -> Self {
        match name {
            "winadj@putty.projects.tartarus.org" | "simple@putty.projects.tartarus.org" => {
                RequestKind::VendorNoop(name.to_string())
            }
            _ => RequestKind::Unknown(name.to_string()),
        }
    }
}

/// Where the success/failure answer to a request goes
#[derive(Debug)]
pub struct RequestReply(Option<oneshot::Sender<bool>>);

impl RequestReply {
    /// A reply slot and the receiver the handler awaits
    pub fn new() -> (RequestReply, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (RequestReply(Some(tx)), rx)
    }

    /// For requests that take no reply
    pub fn none() -> RequestReply {
        RequestReply(None)
    }

    /// Answer the request
    pub fn send(self, ok: bool) {
        if let Some(tx) = self.0 {
            let _ = tx.send(ok);
        }
    }
}

/// One request travelling from the handler to the dispatcher
#[derive(Debug)]
pub struct ChannelRequest {
    /// What was asked
    pub kind: RequestKind,
    /// Where to answer
    pub reply: RequestReply,
}

impl ChannelRequest {
    /// A request whose answer is awaited on the returned receiver
    pub fn new(kind: RequestKind) -> (Self, oneshot::Receiver<bool>) {
        let (reply, rx) = RequestReply::new();
        (ChannelRequest { kind, reply }, rx)
    }

    /// A request that takes no answer
    pub fn unanswered(kind: RequestKind) -> Self {
        ChannelRequest {
            kind,
            reply: RequestReply::none(),
        }
    }
}

/// Out-of-band channel operations the dispatcher performs on termination
#[async_trait]
pub trait ChannelControl: Send + Sync + 'static {
    /// Send `exit-status`
    async fn exit_status(&self, code: u32);

    /// Send EOF and close the channel
    async fn close(&self);
}

/// [`ChannelControl`] over a russh session handle
pub struct RusshChannelControl {
    handle: russh::server::Handle,
    channel: russh::ChannelId,
}

impl RusshChannelControl {
    /// Control `channel` through `handle`
    pub fn new(handle: russh::server::Handle, channel: russh::ChannelId) -> Self {
        RusshChannelControl { handle, channel }
    }
}

#[async_trait]
impl ChannelControl for RusshChannelControl {
    async fn exit_status(&self, code: u32) {
        if self
            .handle
            .exit_status_request(self.channel, code)
            .await
            .is_err()
        {
            debug!(channel = ?self.channel, "exit-status not delivered, session gone");
        }
    }

    async fn close(&self) {
        let _ = self.handle.eof(self.channel).await;
        let _ = self.handle.close(self.channel).await;
    }
}

/// Everything a dispatcher needs from the server and the session
#[derive(Debug, Clone)]
pub struct DispatchEnv {
    /// Shared filesystem
    pub fs: Arc<dyn VirtualFs>,
    /// Shared command table
    pub commands: Arc<CommandTable>,
    /// Session recording settings
    pub recording: RecordingConfig,
    /// Per-command delay in the shell
    pub delay: ProcessDelay,
    /// Authenticated identity
    pub identity: Identity,
    /// Session identifier
    pub session_id: String,
    /// Source address, for recordings
    pub src_ip: String,
}

impl DispatchEnv {
    fn new_context(&self, size: TermSize) -> VirtualContext {
        VirtualContext::new(self.identity.clone(), size)
    }
}

enum Event {
    Request(Option<ChannelRequest>),
    Quit(i32),
}

/// Request loop of one `session` channel
pub struct ChannelDispatcher<S, C> {
    channel: u32,
    requests: mpsc::Receiver<ChannelRequest>,
    stream: Option<S>,
    quit: Option<QuitSignal>,
    done: QuitReceiver,
    control: C,
    slot: Arc<ContextSlot>,
    env: Arc<DispatchEnv>,
    resize: Option<watch::Sender<TermSize>>,
}

impl<S, C> ChannelDispatcher<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: ChannelControl,
{
    /// Create a dispatcher owning the channel's byte stream
    pub fn new(
        channel: u32,
        requests: mpsc::Receiver<ChannelRequest>,
        stream: S,
        control: C,
        slot: Arc<ContextSlot>,
        env: Arc<DispatchEnv>,
    ) -> Self {
        let (quit, done) = QuitSignal::new();
        ChannelDispatcher {
            channel,
            requests,
            stream: Some(stream),
            quit: Some(quit),
            done,
            control,
            slot,
            env,
            resize: None,
        }
    }

    /// Process requests until the leaf service finishes or the request
    /// stream ends; returns the leaf's exit status if it finished
    pub async fn run(mut self) -> Option<i32> {
        loop {
            let event = tokio::select! {
                request = self.requests.recv() => Event::Request(request),
                code = &mut self.done => Event::Quit(code),
            };

            match event {
                Event::Request(Some(request)) => self.handle(request),
                Event::Request(None) => {
                    debug!(channel = self.channel, "Request stream closed");
                    return None;
                }
                Event::Quit(code) => {
                    info!(channel = self.channel, code, "Channel service finished");
                    self.control.exit_status((code & 0xff) as u32).await;
                    self.control.close().await;
                    return Some(code);
                }
            }
        }
    }

    fn context(&self, size: TermSize) -> ContextHandle {
        self.slot.get_or_create(|| self.env.new_context(size))
    }

    fn take_terminal(&mut self) -> Option<(S, QuitSignal)> {
        match (self.stream.take(), self.quit.take()) {
            (Some(stream), Some(quit)) => Some((stream, quit)),
            _ => None,
        }
    }

    /// Answer one request; never performs channel I/O before replying
    fn handle(&mut self, request: ChannelRequest) {
        let ChannelRequest { kind, reply } = request;
        debug!(channel = self.channel, req_type = kind.name(), "Channel request");

        match kind {
            RequestKind::PtyReq { term, size } => {
                let ctx = self.context(size);
                {
                    let mut ctx = ctx.lock();
                    ctx.set_size(size);
                    ctx.set_term(&term);
                }
                if let Some(resize) = &self.resize {
                    let _ = resize.send(size);
                }
                reply.send(true);
            }
            RequestKind::Env { name, value } => {
                debug!(channel = self.channel, name = %name, value = %value, "Env request");
                self.context(TermSize::default()).set_env(&name, &value);
                reply.send(true);
            }
            RequestKind::WindowChange(size) => {
                // Only a running shell has a terminal to resize
                if let Some(resize) = &self.resize {
                    if let Some(ctx) = self.slot.get() {
                        ctx.set_size(size);
                    }
                    let _ = resize.send(size);
                }
                reply.send(true);
            }
            RequestKind::Shell => {
                let Some((stream, quit)) = self.take_terminal() else {
                    warn!(channel = self.channel, "Terminal mode already set, shell refused");
                    return reply.send(false);
                };
                reply.send(true);
                self.start_shell(stream, quit);
            }
            RequestKind::Exec(raw) => {
                let Ok(command) = String::from_utf8(raw) else {
                    warn!(channel = self.channel, "Exec command is not UTF-8");
                    return reply.send(false);
                };
                let Some((stream, quit)) = self.take_terminal() else {
                    warn!(channel = self.channel, "Terminal mode already set, exec refused");
                    return reply.send(false);
                };
                reply.send(true);
                self.start_exec(stream, quit, command.trim().to_string());
            }
            RequestKind::Subsystem(name) => {
                if name != "sftp" {
                    info!(channel = self.channel, subsystem = %name, "Subsystem refused");
                    return reply.send(false);
                }
                let Some((stream, quit)) = self.take_terminal() else {
                    warn!(channel = self.channel, "Terminal mode already set, sftp refused");
                    return reply.send(false);
                };
                reply.send(true);
                info!(channel = self.channel, "SFTP session started");
                let identity = &self.env.identity;
                let sftp = SftpServer::new(
                    self.env.fs.clone(),
                    identity.home.clone(),
                    identity.uid,
                    identity.gid,
                );
                spawn_leaf("sftp", sftp.run(stream), quit);
            }
            RequestKind::VendorNoop(name) => {
                debug!(channel = self.channel, req_type = %name, "Vendor request ignored");
                reply.send(true);
            }
            RequestKind::Unknown(name) => {
                info!(channel = self.channel, req_type = %name, "Unknown channel request");
                reply.send(false);
            }
        }
    }

    fn start_shell(&mut self, stream: S, quit: QuitSignal) {
        let ctx = self.context(TermSize::default());
        let (size, term) = {
            let ctx = ctx.lock();
            (ctx.size(), ctx.term().to_string())
        };
        info!(channel = self.channel, term = %term, width = size.width, height = size.height, "Shell started");

        let (resize_tx, resize_rx) = watch::channel(size);
        self.resize = Some(resize_tx);

        let (reader, writer) = tokio::io::split(stream);
        let mut terminal = Terminal::new(reader, writer, size).with_resize(resize_rx);
        let meta = SessionMeta {
            user: self.env.identity.user.clone(),
            src_ip: self.env.src_ip.clone(),
            session_id: self.env.session_id.clone(),
            term,
            size,
        };
        if let Some(recorder) = self.env.recording.open(&meta) {
            terminal = terminal.with_recorder(recorder);
        }

        let shell = Shell::new(
            terminal,
            ctx,
            self.env.fs.clone(),
            self.env.commands.clone(),
        )
        .with_delay(self.env.delay);
        spawn_leaf("shell", shell.run(), quit);
    }

    fn start_exec(&mut self, stream: S, quit: QuitSignal, command: String) {
        info!(channel = self.channel, cmd = %command, "Exec request");
        let ctx = self.context(TermSize::default());

        let is_scp = command
            .split_whitespace()
            .next()
            .and_then(|word| word.rsplit('/').next())
            .is_some_and(|name| name.starts_with("scp"));
        if !is_scp {
            let run = services::run_command(
                stream,
                command,
                ctx,
                self.env.fs.clone(),
                self.env.commands.clone(),
            );
            spawn_leaf("exec", run, quit);
            return;
        }

        let (cwd, home) = {
            let ctx = ctx.lock();
            (ctx.cwd().to_string(), ctx.identity().home.clone())
        };
        match ScpMode::parse(&command, &cwd, &home) {
            Some(mode) => {
                let scp = ScpService::new(self.env.fs.clone(), mode);
                spawn_leaf("scp", scp.run(stream), quit);
            }
            None => {
                let usage = "usage: scp [-r] -t|-f path\r\n";
                spawn_leaf("scp", services::reply_and_exit(stream, usage, 1), quit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserEntry;
    use crate::os::fs::MemoryFs;
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    #[derive(Clone, Default)]
    struct MockControl {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl MockControl {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelControl for MockControl {
        async fn exit_status(&self, code: u32) {
            self.calls.lock().unwrap().push(format!("exit-status {}", code));
        }

        async fn close(&self) {
            self.calls.lock().unwrap().push("close".to_string());
        }
    }

    struct Harness {
        requests: mpsc::Sender<ChannelRequest>,
        client: DuplexStream,
        control: MockControl,
        slot: Arc<ContextSlot>,
        task: JoinHandle<Option<i32>>,
    }

    impl Harness {
        fn start() -> Self {
            let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
            let (client, server) = duplex(64 * 1024);
            let control = MockControl::default();
            let slot = Arc::new(ContextSlot::new());
            let env = Arc::new(DispatchEnv {
                fs: Arc::new(MemoryFs::seeded("svr04", &[])),
                commands: Arc::new(CommandTable::with_builtins()),
                recording: RecordingConfig::disabled(),
                delay: ProcessDelay::default(),
                identity: Identity::for_user(&UserEntry::new("root", "toor"), "svr04"),
                session_id: "test".into(),
                src_ip: "192.0.2.10".into(),
            });
            let dispatcher =
                ChannelDispatcher::new(0, rx, server, control.clone(), slot.clone(), env);
            Harness {
                requests: tx,
                client,
                control,
                slot,
                task: tokio::spawn(dispatcher.run()),
            }
        }

        async fn request(&self, kind: RequestKind) -> bool {
            let (request, reply) = ChannelRequest::new(kind);
            self.requests.send(request).await.unwrap();
            reply.await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_duplicate_shell_is_refused() {
        let mut h = Harness::start();
        assert!(h.request(RequestKind::Shell).await);
        assert!(!h.request(RequestKind::Shell).await);
        assert!(!h.request(RequestKind::Exec(b"id".to_vec())).await);

        h.client.write_all(b"quit\r").await.unwrap();
        assert_eq!(h.task.await.unwrap(), Some(0));
        assert_eq!(h.control.calls(), vec!["exit-status 0", "close"]);

        let mut out = String::new();
        h.client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "$ quit\r\nlogout\r\n");
    }

    #[tokio::test]
    async fn test_pty_env_then_shell() {
        let mut h = Harness::start();
        assert!(
            h.request(RequestKind::PtyReq {
                term: "vt100".into(),
                size: TermSize::new(132, 43),
            })
            .await
        );
        assert!(
            h.request(RequestKind::Env {
                name: "LANG".into(),
                value: "C".into(),
            })
            .await
        );
        assert!(h.request(RequestKind::Shell).await);

        assert!(h.request(RequestKind::WindowChange(TermSize::new(100, 30))).await);

        h.client.write_all(b"echo $LANG $TERM\r").await.unwrap();
        let mut buf = vec![0u8; 64];
        let mut seen = String::new();
        while !seen.contains("C vt100\r\n") {
            let n = h.client.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }

        let ctx = h.slot.get().unwrap();
        assert_eq!(ctx.size(), TermSize::new(100, 30));

        h.client.write_all(b"exit 2\r").await.unwrap();
        assert_eq!(h.task.await.unwrap(), Some(2));
        assert_eq!(h.control.calls(), vec!["exit-status 2", "close"]);
    }

    #[tokio::test]
    async fn test_exec_unknown_command() {
        let mut h = Harness::start();
        assert!(h.request(RequestKind::Exec(b"wget http://x".to_vec())).await);
        assert_eq!(h.task.await.unwrap(), Some(127));

        let mut out = String::new();
        h.client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "wget: command not found\r\n");
        assert_eq!(h.control.calls(), vec!["exit-status 127", "close"]);
    }

    #[tokio::test]
    async fn test_malformed_exec_keeps_channel_open() {
        let mut h = Harness::start();
        assert!(!h.request(RequestKind::Exec(vec![0xff, 0xfe])).await);
        assert!(!h.request(RequestKind::Subsystem("netconf".into())).await);
        assert!(!h.request(RequestKind::other("x11-req")).await);
        assert!(h.request(RequestKind::other("winadj@putty.projects.tartarus.org")).await);

        assert!(h.request(RequestKind::Exec(b"hostname".to_vec())).await);
        assert_eq!(h.task.await.unwrap(), Some(0));
        let mut out = String::new();
        h.client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "svr04\r\n");
    }

    #[tokio::test]
    async fn test_exec_scp_upload() {
        let mut h = Harness::start();
        assert!(h.request(RequestKind::Exec(b"scp -t /tmp".to_vec())).await);

        let mut ack = [0u8; 1];
        h.client.read_exact(&mut ack).await.unwrap();
        h.client.write_all(b"C0644 3 a.txt\nabc\0").await.unwrap();
        h.client.read_exact(&mut ack).await.unwrap();
        h.client.read_exact(&mut ack).await.unwrap();
        h.client.shutdown().await.unwrap();

        assert_eq!(h.task.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_window_change_without_shell_is_ignored() {
        let h = Harness::start();
        assert!(
            h.request(RequestKind::PtyReq {
                term: "xterm".into(),
                size: TermSize::new(80, 24),
            })
            .await
        );
        assert!(h.request(RequestKind::WindowChange(TermSize::new(200, 60))).await);
        assert_eq!(h.slot.get().unwrap().size(), TermSize::new(80, 24));

        drop(h.requests);
        assert_eq!(h.task.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_request_stream_end_stops_loop() {
        let h = Harness::start();
        drop(h.requests);
        assert_eq!(h.task.await.unwrap(), None);
        assert!(h.control.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_quit_signal_is_abnormal() {
        let (quit, done) = QuitSignal::new();
        drop(quit);
        assert_eq!(done.await, EXIT_ABNORMAL);

        let (quit, done) = QuitSignal::new();
        quit.send(0);
        assert_eq!(done.await, 0);
    }

    #[test]
    fn test_request_names() {
        assert_eq!(RequestKind::Shell.name(), "shell");
        assert_eq!(RequestKind::Exec(vec![]).name(), "exec");
        assert_eq!(
            RequestKind::other("simple@putty.projects.tartarus.org"),
            RequestKind::VendorNoop("simple@putty.projects.tartarus.org".into())
        );
    }
}
