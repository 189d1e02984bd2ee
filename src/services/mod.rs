//! Leaf services
//!
//! A leaf service owns a channel's byte stream once the channel has entered
//! its terminal mode (`shell`, `exec` or `subsystem`). Every leaf runs in its
//! own task through [`spawn_leaf`], which reports the exit status through the
//! channel's [`QuitSignal`] exactly once, including when the leaf panics.
//!
//! The interactive shell lives in [`crate::os::shell`]; this module holds the
//! one-shot `exec` runner and the file transfer services.

pub mod scp;
pub mod sftp;

pub use scp::{ScpMode, ScpService};
pub use sftp::SftpServer;

use crate::helper::to_crlf;
use crate::os::command::CommandTable;
use crate::os::context::ContextHandle;
use crate::os::fs::VirtualFs;
use crate::os::shell::{interpret, LineOutcome};
use crate::ssh::channel::{QuitSignal, EXIT_ABNORMAL};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Run `service` in its own task and deliver its exit status to `quit`
///
/// A panic inside the service is logged and reported as exit status 1.
pub fn spawn_leaf<F>(name: &'static str, service: F, quit: QuitSignal) -> JoinHandle<()>
where
    F: Future<Output = i32> + Send + 'static,
{
    tokio::spawn(async move {
        let code = match AssertUnwindSafe(service).catch_unwind().await {
            Ok(code) => code,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(service = name, reason = %reason, "Service panicked");
                EXIT_ABNORMAL
            }
        };
        debug!(service = name, code, "Service finished");
        quit.send(code);
    })
}

/// Run one command line for an `exec` request and write its output
pub async fn run_command<S>(
    mut stream: S,
    line: String,
    context: ContextHandle,
    fs: Arc<dyn VirtualFs>,
    commands: Arc<CommandTable>,
) -> i32
where
    S: AsyncWrite + Unpin + Send,
{
    let (code, output) = match interpret(&line, &context, fs.as_ref(), &commands) {
        LineOutcome::Empty => (0, Vec::new()),
        LineOutcome::Exit(code) => (code, Vec::new()),
        LineOutcome::Ran { code, output } => (code, output),
    };

    if !output.is_empty() {
        if let Err(e) = stream.write_all(&to_crlf(&output)).await {
            debug!(error = %e, "Exec output dropped");
        }
    }
    let _ = stream.shutdown().await;
    code
}

/// Write `message` and finish with `code`
pub async fn reply_and_exit<S>(mut stream: S, message: &'static str, code: i32) -> i32
where
    S: AsyncWrite + Unpin + Send,
{
    let _ = stream.write_all(message.as_bytes()).await;
    let _ = stream.shutdown().await;
    code
}
