//! Virtual execution context
//!
//! The fabricated per-session OS view: working directory, environment and
//! terminal geometry. A session owns one [`ContextSlot`]; the first channel
//! that needs a context fills it and later channels reuse the same
//! [`ContextHandle`].

use super::fs::{resolve_path, VirtualFs};
use crate::config::UserEntry;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Terminal geometry in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    /// Columns
    pub width: u32,
    /// Rows
    pub height: u32,
}

impl TermSize {
    /// Create a size
    pub fn new(width: u32, height: u32) -> Self {
        TermSize { width, height }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        TermSize {
            width: 80,
            height: 24,
        }
    }
}

/// Identity of the logged-in account inside the fabricated system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Login name
    pub user: String,
    /// Numeric user id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
    /// Home directory
    pub home: String,
    /// Login shell
    pub shell: String,
    /// Host name
    pub hostname: String,
}

impl Identity {
    /// Identity of a configured account
    pub fn for_user(user: &UserEntry, hostname: &str) -> Self {
        Identity {
            user: user.name.clone(),
            uid: user.uid,
            gid: user.gid,
            home: user.home_dir(),
            shell: user.shell.clone(),
            hostname: hostname.to_string(),
        }
    }
}

/// Fabricated OS state of one session
#[derive(Debug, Clone)]
pub struct VirtualContext {
    identity: Identity,
    cwd: String,
    term: String,
    size: TermSize,
    env: HashMap<String, String>,
}

impl VirtualContext {
    /// Create a context positioned in the user's home directory
    pub fn new(identity: Identity, size: TermSize) -> Self {
        let mut env = HashMap::new();
        env.insert("USER".to_string(), identity.user.clone());
        env.insert("LOGNAME".to_string(), identity.user.clone());
        env.insert("HOME".to_string(), identity.home.clone());
        env.insert("SHELL".to_string(), identity.shell.clone());
        env.insert("PWD".to_string(), identity.home.clone());
        env.insert(
            "PATH".to_string(),
            "/usr/local/bin:/usr/bin:/bin:/usr/local/games:/usr/games".to_string(),
        );
        env.insert("?".to_string(), "0".to_string());

        VirtualContext {
            cwd: identity.home.clone(),
            identity,
            term: "xterm".to_string(),
            size,
            env,
        }
    }

    /// Logged-in identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Current working directory
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Terminal type from the last `pty-req`
    pub fn term(&self) -> &str {
        &self.term
    }

    /// Terminal geometry
    pub fn size(&self) -> TermSize {
        self.size
    }

    /// Resolve a path relative to the working directory
    pub fn resolve(&self, path: &str) -> String {
        resolve_path(&self.cwd, &self.identity.home, path)
    }

    /// Change directory; fails when the target is not an existing directory
    pub fn chdir(&mut self, fs: &dyn VirtualFs, path: &str) -> io::Result<()> {
        let target = self.resolve(path);
        if !fs.is_dir(&target) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: No such file or directory", path),
            ));
        }
        self.env.insert("OLDPWD".to_string(), self.cwd.clone());
        self.env.insert("PWD".to_string(), target.clone());
        self.cwd = target;
        Ok(())
    }

    /// Read an environment variable
    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    /// Set an environment variable (last write wins)
    pub fn set_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.insert(name.into(), value.into());
    }

    /// Environment sorted by name, without the `?` status variable
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<_> = self
            .env
            .iter()
            .filter(|(k, _)| k.as_str() != "?")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        vars.sort();
        vars
    }

    /// Update the terminal geometry
    pub fn set_size(&mut self, size: TermSize) {
        self.size = size;
        self.env.insert("COLUMNS".to_string(), size.width.to_string());
        self.env.insert("LINES".to_string(), size.height.to_string());
    }

    /// Record the terminal type
    pub fn set_term(&mut self, term: &str) {
        if !term.is_empty() {
            self.term = term.to_string();
            self.env.insert("TERM".to_string(), term.to_string());
        }
    }
}

/// Shared, lock-guarded access to a session's context
#[derive(Debug, Clone)]
pub struct ContextHandle(Arc<Mutex<VirtualContext>>);

impl ContextHandle {
    /// Wrap a context
    pub fn new(ctx: VirtualContext) -> Self {
        ContextHandle(Arc::new(Mutex::new(ctx)))
    }

    /// Lock the context; never hold the guard across an `.await`
    pub fn lock(&self) -> MutexGuard<'_, VirtualContext> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current geometry
    pub fn size(&self) -> TermSize {
        self.lock().size()
    }

    /// Update the geometry
    pub fn set_size(&self, size: TermSize) {
        self.lock().set_size(size);
    }

    /// Set an environment variable
    pub fn set_env(&self, name: &str, value: &str) {
        self.lock().set_env(name, value);
    }
}

/// Session-owned slot holding the lazily created context
#[derive(Debug, Default)]
pub struct ContextSlot {
    inner: Mutex<Option<ContextHandle>>,
}

impl ContextSlot {
    /// An empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// The context, if one was created
    pub fn get(&self) -> Option<ContextHandle> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The existing context, or a new one built by `create`
    pub fn get_or_create(&self, create: impl FnOnce() -> VirtualContext) -> ContextHandle {
        let mut slot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        slot.get_or_insert_with(|| ContextHandle::new(create()))
            .clone()
    }
}
