//! Per-source-IP admission control
//!
//! Tracks the number of live connections per source address and refuses new
//! sockets once a host reaches its limit.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// Live connection counts keyed by source IP
#[derive(Debug)]
pub struct ConnectionLimiter {
    counts: DashMap<IpAddr, usize>,
    max_per_host: usize,
}

impl ConnectionLimiter {
    /// Create a limiter; `max_per_host == 0` disables the limit
    pub fn new(max_per_host: usize) -> Self {
        ConnectionLimiter {
            counts: DashMap::new(),
            max_per_host,
        }
    }

    /// Admit one more connection from `ip` if it is below the limit
    ///
    /// The check and the increment happen under the same shard lock, so
    /// concurrent callers can never push a host above the maximum.
    pub fn try_admit(&self, ip: IpAddr) -> bool {
        let mut count = self.counts.entry(ip).or_insert(0);
        if self.max_per_host != 0 && *count >= self.max_per_host {
            return false;
        }
        *count += 1;
        true
    }

    /// Release one connection from `ip`
    ///
    /// Releasing a host with no live connections is a bookkeeping bug; it is
    /// logged and the count stays at zero.
    pub fn release(&self, ip: IpAddr) {
        match self.counts.entry(ip) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                } else {
                    *entry.get_mut() -= 1;
                }
            }
            Entry::Vacant(_) => {
                warn!(src_ip = %ip, "Release without a live connection, count clamped at zero");
            }
        }
    }

    /// Admit `ip` and return a guard that releases it on drop
    pub fn admit(self: &Arc<Self>, ip: IpAddr) -> Option<AdmissionGuard> {
        if self.try_admit(ip) {
            Some(AdmissionGuard {
                limiter: Arc::clone(self),
                ip,
            })
        } else {
            None
        }
    }

    /// Live connections for `ip`
    pub fn count(&self, ip: IpAddr) -> usize {
        self.counts.get(&ip).map(|c| *c).unwrap_or(0)
    }

    /// Configured per-host maximum
    pub fn max_per_host(&self) -> usize {
        self.max_per_host
    }
}

/// Releases one admission when dropped
#[derive(Debug)]
pub struct AdmissionGuard {
    limiter: Arc<ConnectionLimiter>,
    ip: IpAddr,
}

impl AdmissionGuard {
    /// Source address this guard accounts for
    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.limiter.release(self.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_admit_up_to_limit() {
        let limiter = ConnectionLimiter::new(2);
        assert!(limiter.try_admit(ip(1)));
        assert!(limiter.try_admit(ip(1)));
        assert!(!limiter.try_admit(ip(1)));
        assert_eq!(limiter.count(ip(1)), 2);

        // other hosts are unaffected
        assert!(limiter.try_admit(ip(2)));
    }

    #[test]
    fn test_rejection_leaves_count_unchanged() {
        let limiter = ConnectionLimiter::new(1);
        assert!(limiter.try_admit(ip(1)));
        assert!(!limiter.try_admit(ip(1)));
        assert!(!limiter.try_admit(ip(1)));
        assert_eq!(limiter.count(ip(1)), 1);
    }

    #[test]
    fn test_release_never_goes_negative() {
        let limiter = ConnectionLimiter::new(3);
        assert!(limiter.try_admit(ip(1)));
        limiter.release(ip(1));
        limiter.release(ip(1));
        limiter.release(ip(9));
        assert_eq!(limiter.count(ip(1)), 0);
        assert_eq!(limiter.count(ip(9)), 0);

        // still admits the full quota afterwards
        for _ in 0..3 {
            assert!(limiter.try_admit(ip(1)));
        }
        assert!(!limiter.try_admit(ip(1)));
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limiter = ConnectionLimiter::new(0);
        for _ in 0..100 {
            assert!(limiter.try_admit(ip(1)));
        }
        assert_eq!(limiter.count(ip(1)), 100);
    }

    #[test]
    fn test_guard_releases_once() {
        let limiter = Arc::new(ConnectionLimiter::new(1));
        let guard = limiter.admit(ip(1)).unwrap();
        assert_eq!(guard.ip(), ip(1));
        assert!(limiter.admit(ip(1)).is_none());
        drop(guard);
        assert_eq!(limiter.count(ip(1)), 0);
        assert!(limiter.admit(ip(1)).is_some());
    }

    #[test]
    fn test_concurrent_admission_respects_limit() {
        let limiter = Arc::new(ConnectionLimiter::new(5));
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    if limiter.try_admit(ip(7)) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 5);
        assert_eq!(limiter.count(ip(7)), 5);
    }

    #[test]
    fn test_concurrent_admit_and_release() {
        let limiter = Arc::new(ConnectionLimiter::new(4));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(guard) = limiter.admit(ip(3)) {
                            assert!(limiter.count(ip(3)) <= 4);
                            drop(guard);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(limiter.count(ip(3)), 0);
    }
}
