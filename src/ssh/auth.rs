//! Password authentication policy
//!
//! Decisions are pure: [`PasswordChallenge::decide`] never sleeps, the
//! handler applies the configured retry delay before sending a rejection.
//!
//! Precedence is exact credential match, then the deception branch, then
//! rejection. The deception branch lets an attacker in with a wrong password
//! so the session can be observed; [`RetryPolicy`] decides whether that
//! happens on the first try or only on the last allowed one.

use crate::config::{ServerConfig, UserEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// When a wrong password is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Accept the first attempt
    AcceptOnFirstAttempt,
    /// Reject until exactly one try remains, then accept
    AcceptOnLastTry,
}

impl RetryPolicy {
    /// Policy for the `allow_retry_login` setting
    pub fn from_config(allow_retry_login: bool) -> Self {
        if allow_retry_login {
            RetryPolicy::AcceptOnLastTry
        } else {
            RetryPolicy::AcceptOnFirstAttempt
        }
    }
}

/// Configured accounts by name
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, UserEntry>,
}

impl UserTable {
    /// Index `users` by name; later duplicates win
    pub fn new(users: &[UserEntry]) -> Self {
        UserTable {
            users: users.iter().map(|u| (u.name.clone(), u.clone())).collect(),
        }
    }

    /// Look up an account
    pub fn get(&self, name: &str) -> Option<&UserEntry> {
        self.users.get(name)
    }

    /// Number of accounts
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True when no accounts are configured
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Outcome of one password attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Log the client in as `user`
    Accept {
        /// The account the session runs as
        user: UserEntry,
        /// Granted permission; recorded only
        permit_agent_forwarding: bool,
        /// True when the password was wrong and the deception branch let
        /// the client in
        deceived: bool,
    },
    /// Refuse this attempt
    Reject,
}

/// Server-wide password policy
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    users: UserTable,
    allow_unknown_user: bool,
    retry: RetryPolicy,
    max_tries: u32,
    retry_delay: Duration,
}

impl PasswordPolicy {
    /// Build a policy
    pub fn new(
        users: UserTable,
        allow_unknown_user: bool,
        retry: RetryPolicy,
        max_tries: u32,
        retry_delay: Duration,
    ) -> Self {
        PasswordPolicy {
            users,
            allow_unknown_user,
            retry,
            max_tries,
            retry_delay,
        }
    }

    /// Policy from the `[server]` section and the `[[users]]` table
    pub fn from_config(server: &ServerConfig, users: &[UserEntry]) -> Self {
        Self::new(
            UserTable::new(users),
            server.allow_random_user,
            RetryPolicy::from_config(server.allow_retry_login),
            server.max_tries,
            Duration::from_millis(server.retry_delay_ms),
        )
    }

    /// Start the per-connection attempt counter
    pub fn challenge(self: &Arc<Self>) -> PasswordChallenge {
        PasswordChallenge {
            policy: self.clone(),
            remaining: self.max_tries,
        }
    }

    /// Delay before a rejection is sent
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Configured accounts
    pub fn users(&self) -> &UserTable {
        &self.users
    }
}

/// Per-connection state of the password policy
#[derive(Debug, Clone)]
pub struct PasswordChallenge {
    policy: Arc<PasswordPolicy>,
    remaining: u32,
}

impl PasswordChallenge {
    /// Tries left before the deception branch gives in
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Decide one attempt
    pub fn decide(&mut self, user: &str, password: &str) -> AuthDecision {
        let known = self.policy.users.get(user);

        if let Some(entry) = known {
            if !entry.is_wildcard() && entry.password == password {
                return AuthDecision::Accept {
                    user: entry.clone(),
                    permit_agent_forwarding: true,
                    deceived: false,
                };
            }
        }

        if known.is_none() && !self.policy.allow_unknown_user {
            return AuthDecision::Reject;
        }

        let accept = match self.policy.retry {
            RetryPolicy::AcceptOnFirstAttempt => true,
            RetryPolicy::AcceptOnLastTry if self.remaining <= 1 => true,
            RetryPolicy::AcceptOnLastTry => {
                self.remaining -= 1;
                false
            }
        };
        if !accept {
            return AuthDecision::Reject;
        }

        let account = match known {
            Some(entry) => entry.clone(),
            None => synthesized_account(user, password),
        };
        AuthDecision::Accept {
            user: account,
            permit_agent_forwarding: true,
            deceived: true,
        }
    }
}

fn synthesized_account(name: &str, password: &str) -> UserEntry {
    let mut entry = UserEntry::new(name, password);
    if name == "root" {
        entry.uid = 0;
        entry.gid = 0;
    }
    entry
}
