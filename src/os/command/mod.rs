//! Command table
//!
//! Commands are registered once at startup into a [`CommandTable`], which is
//! then shared read-only (behind an `Arc`) by every shell and `exec` request.

mod builtins;

pub use builtins::{Cat, Echo, Env, Hostname, Id, Ls, Pwd, Uname, Whoami};

use super::context::VirtualContext;
use super::fs::VirtualFs;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// `/proc/version` contents and `uname -v` source
pub const KERNEL_VERSION: &str = "Linux version 4.9.0-8-amd64 (debian-kernel@lists.debian.org) \
     (gcc version 6.3.0 20170516 (Debian 6.3.0-18+deb9u1) ) #1 SMP Debian 4.9.144-3.1 (2019-02-19)";

/// Everything a command may touch while it runs
pub struct ExecContext<'a> {
    /// Session context (cwd, env, identity)
    pub ctx: &'a mut VirtualContext,
    /// Filesystem
    pub fs: &'a dyn VirtualFs,
    /// Collected standard output (`\n` line endings)
    pub stdout: Vec<u8>,
}

impl<'a> ExecContext<'a> {
    /// Create an execution context with empty output
    pub fn new(ctx: &'a mut VirtualContext, fs: &'a dyn VirtualFs) -> Self {
        ExecContext {
            ctx,
            fs,
            stdout: Vec::new(),
        }
    }

    /// Append text to the output
    pub fn print(&mut self, text: &str) {
        self.stdout.extend_from_slice(text.as_bytes());
    }

    /// Append a line to the output
    pub fn println(&mut self, text: &str) {
        self.print(text);
        self.stdout.push(b'\n');
    }
}

/// An executable capability of the fabricated system
pub trait Command: Send + Sync + Debug {
    /// Run with `args` (not including the command name) and return the exit code
    fn execute(&self, args: &[String], exec: &mut ExecContext<'_>) -> i32;
}

/// Name to command mapping
#[derive(Debug, Default, Clone)]
pub struct CommandTable {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding the stock commands
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("cat", Arc::new(Cat));
        table.register("echo", Arc::new(Echo));
        table.register("env", Arc::new(Env));
        table.register("printenv", Arc::new(Env));
        table.register("hostname", Arc::new(Hostname));
        table.register("id", Arc::new(Id));
        table.register("ls", Arc::new(Ls));
        table.register("pwd", Arc::new(Pwd));
        table.register("uname", Arc::new(Uname));
        table.register("whoami", Arc::new(Whoami));
        table
    }

    /// Register (or replace) a command
    pub fn register(&mut self, name: impl Into<String>, command: Arc<dyn Command>) {
        self.commands.insert(name.into(), command);
    }

    /// Look a command up by name or path (`/bin/ls` finds `ls`)
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Command>> {
        let base = name.rsplit('/').next().unwrap_or(name);
        self.commands.get(base).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
