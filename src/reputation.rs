//! Attacker reputation reporting
//!
//! Every admitted connection opens a profile, tags it with categories and
//! uploads it when the connection ends. Reporting is fire-and-forget:
//! implementations log their own failures and never return errors.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use tracing::info;

/// Protocol an abuse category was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    /// SSH
    Ssh,
}

/// Observed behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Behavior {
    /// Generic intrusion attempt
    Hacking,
    /// Password guessing
    BruteForce,
    /// Port forwarding through the honeypot
    Proxying,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ssh => write!(f, "ssh"),
        }
    }
}

impl fmt::Display for Behavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Behavior::Hacking => write!(f, "hacking"),
            Behavior::BruteForce => write!(f, "brute-force"),
            Behavior::Proxying => write!(f, "proxying"),
        }
    }
}

/// Reputation service client
pub trait ReputationReporter: Send + Sync + fmt::Debug {
    /// Start a profile for `ip`
    fn create_profile(&self, ip: IpAddr);

    /// Tag the profile of `ip`
    fn add_category(&self, ip: IpAddr, protocol: Protocol, behavior: Behavior);

    /// Submit and discard the profile of `ip`
    fn upload_report(&self, ip: IpAddr);
}

/// Reporter that does nothing
#[derive(Debug, Default)]
pub struct NullReporter;

impl ReputationReporter for NullReporter {
    fn create_profile(&self, _ip: IpAddr) {}
    fn add_category(&self, _ip: IpAddr, _protocol: Protocol, _behavior: Behavior) {}
    fn upload_report(&self, _ip: IpAddr) {}
}

/// Reporter that accumulates profiles and emits them as log records
#[derive(Debug, Default)]
pub struct LogReporter {
    profiles: DashMap<IpAddr, BTreeSet<(Protocol, Behavior)>>,
}

impl LogReporter {
    /// An empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Categories currently held for `ip`
    pub fn categories(&self, ip: IpAddr) -> Vec<(Protocol, Behavior)> {
        self.profiles
            .get(&ip)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open profiles
    pub fn open_profiles(&self) -> usize {
        self.profiles.len()
    }
}

impl ReputationReporter for LogReporter {
    fn create_profile(&self, ip: IpAddr) {
        self.profiles.entry(ip).or_default();
    }

    fn add_category(&self, ip: IpAddr, protocol: Protocol, behavior: Behavior) {
        self.profiles
            .entry(ip)
            .or_default()
            .insert((protocol, behavior));
    }

    fn upload_report(&self, ip: IpAddr) {
        if let Some((_, categories)) = self.profiles.remove(&ip) {
            let categories: Vec<String> = categories
                .iter()
                .map(|(p, b)| format!("{}:{}", p, b))
                .collect();
            info!(src_ip = %ip, categories = ?categories, "Reputation report");
        }
    }
}
