//! User table configuration
//!
//! Each `[[users]]` entry describes an account of the fabricated system.

use serde::{Deserialize, Serialize};

/// Stored credential meaning "any password goes through the deception branch"
pub const WILDCARD_PASSWORD: &str = "*";

fn default_shell() -> String {
    "/bin/bash".to_string()
}

/// A fabricated account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserEntry {
    /// Login name
    pub name: String,

    /// Accepted password, or `*`
    pub password: String,

    /// Home directory; defaults to `/home/<name>` (or `/root` for root)
    #[serde(default)]
    pub home: Option<String>,

    /// Numeric user id
    #[serde(default)]
    pub uid: u32,

    /// Numeric group id
    #[serde(default)]
    pub gid: u32,

    /// Login shell shown by `env` and friends
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl UserEntry {
    /// Create an entry with default home, ids and shell
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        UserEntry {
            name: name.into(),
            password: password.into(),
            home: None,
            uid: 1000,
            gid: 1000,
            shell: default_shell(),
        }
    }

    /// Resolved home directory
    pub fn home_dir(&self) -> String {
        match &self.home {
            Some(home) => home.clone(),
            None if self.name == "root" => "/root".to_string(),
            None => format!("/home/{}", self.name),
        }
    }

    /// Whether the stored password is the wildcard sentinel
    pub fn is_wildcard(&self) -> bool {
        self.password == WILDCARD_PASSWORD
    }
}
