//! Interactive shell
//!
//! A read-eval loop over a [`Terminal`]. `cd`, `export` and the exit words
//! are handled here; every other line is dispatched through the injected
//! [`CommandTable`]. The exit status of each command lands in `$?`.

use super::command::{CommandTable, ExecContext};
use super::context::ContextHandle;
use super::fs::VirtualFs;
use super::terminal::Terminal;
use crate::helper::{jittered_delay, PROCESS_DELAY_JITTER_MS};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Prompt shown before every line
pub const PROMPT: &str = "$ ";

/// Exit status of a command that is not in the table
pub const EXIT_NOT_FOUND: i32 = 127;

/// Artificial per-command latency
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessDelay {
    base_ms: u64,
}

impl ProcessDelay {
    /// Delay of about `base_ms` (with jitter); zero disables it
    pub fn new(base_ms: u64) -> Self {
        ProcessDelay { base_ms }
    }

    /// Draw the delay for the next command
    pub fn sample(&self) -> Option<Duration> {
        (self.base_ms > 0).then(|| jittered_delay(self.base_ms, PROCESS_DELAY_JITTER_MS))
    }
}

/// Result of interpreting one input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Blank line
    Empty,
    /// `logout`, `quit` or `exit [code]`
    Exit(i32),
    /// A builtin or table command ran
    Ran {
        /// Exit status
        code: i32,
        /// Output with `\n` line endings
        output: Vec<u8>,
    },
}

/// Interpret one line against the context, filesystem and command table
pub fn interpret(
    line: &str,
    context: &ContextHandle,
    fs: &dyn VirtualFs,
    commands: &CommandTable,
) -> LineOutcome {
    let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    let Some((name, args)) = argv.split_first() else {
        return LineOutcome::Empty;
    };

    let mut ctx = context.lock();
    let (code, output) = match name.as_str() {
        "logout" | "quit" => return LineOutcome::Exit(0),
        "exit" => {
            let code = args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
            return LineOutcome::Exit(code);
        }
        "cd" => {
            let target = args
                .first()
                .cloned()
                .unwrap_or_else(|| ctx.identity().home.clone());
            match ctx.chdir(fs, &target) {
                Ok(()) => (0, Vec::new()),
                Err(_) => (
                    1,
                    format!("-bash: cd: {}: No such file or directory\n", target).into_bytes(),
                ),
            }
        }
        "export" => {
            if args.is_empty() {
                let listing: String = ctx
                    .env_vars()
                    .into_iter()
                    .map(|(k, v)| format!("declare -x {}=\"{}\"\n", k, v))
                    .collect();
                (0, listing.into_bytes())
            } else {
                for arg in args {
                    if let Some((key, value)) = arg.split_once('=') {
                        if !key.is_empty() {
                            ctx.set_env(key, value);
                        }
                    }
                }
                (0, Vec::new())
            }
        }
        _ => match commands.lookup(name) {
            Some(command) => {
                let mut exec = ExecContext::new(&mut ctx, fs);
                let code = command.execute(args, &mut exec);
                (code, exec.stdout)
            }
            None => (
                EXIT_NOT_FOUND,
                format!("{}: command not found\n", name).into_bytes(),
            ),
        },
    };

    ctx.set_env("?", code.to_string());
    LineOutcome::Ran { code, output }
}

/// The interactive shell bound to one channel
pub struct Shell<R, W> {
    terminal: Terminal<R, W>,
    context: ContextHandle,
    fs: Arc<dyn VirtualFs>,
    commands: Arc<CommandTable>,
    delay: ProcessDelay,
}

impl<R, W> Shell<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Bind a shell to a terminal, context, filesystem and command table
    pub fn new(
        terminal: Terminal<R, W>,
        context: ContextHandle,
        fs: Arc<dyn VirtualFs>,
        commands: Arc<CommandTable>,
    ) -> Self {
        Shell {
            terminal,
            context,
            fs,
            commands,
            delay: ProcessDelay::default(),
        }
    }

    /// Inject a per-command delay
    pub fn with_delay(mut self, delay: ProcessDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Run until the client logs out or disconnects; returns the exit status
    pub async fn run(mut self) -> i32 {
        let (user, home) = {
            let ctx = self.context.lock();
            (ctx.identity().user.clone(), ctx.identity().home.clone())
        };
        if !self.fs.is_dir(&home) {
            if let Err(e) = self.fs.create_dir_all(&home) {
                warn!(home = %home, error = %e, "Failed to create home directory");
            }
        }

        loop {
            let line = match self.terminal.read_line(PROMPT).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(user = %user, "Shell input closed");
                    return 0;
                }
                Err(e) => {
                    warn!(user = %user, error = %e, "Shell read failed");
                    return 0;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            info!(user = %user, cmd = %trimmed, "Shell command");

            if let Some(delay) = self.delay.sample() {
                tokio::time::sleep(delay).await;
            }

            match interpret(trimmed, &self.context, self.fs.as_ref(), &self.commands) {
                LineOutcome::Empty => {}
                LineOutcome::Exit(code) => {
                    let _ = self.terminal.write_output(b"logout\n").await;
                    return code;
                }
                LineOutcome::Ran { output, .. } => {
                    if let Err(e) = self.terminal.write_output(&output).await {
                        warn!(user = %user, error = %e, "Shell write failed");
                        return 0;
                    }
                }
            }
        }
    }
}
