//! Helper utilities for Mirage
//!
//! This module provides common utility functions used throughout the server.

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default buffer size for IO operations
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default connect timeout for relay targets, in seconds
///
/// The dial runs inside the session's event loop, so it stays short.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 3;

/// Spread applied around the configured command delay, in milliseconds
pub const PROCESS_DELAY_JITTER_MS: u64 = 500;

/// Seconds since the Unix epoch
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `base_ms` plus a uniform offset in `[-spread_ms, +spread_ms]`, never negative
pub fn jittered_delay(base_ms: u64, spread_ms: u64) -> Duration {
    let spread = spread_ms as i64;
    let offset = if spread > 0 {
        rand::thread_rng().gen_range(-spread..=spread)
    } else {
        0
    };
    Duration::from_millis((base_ms as i64 + offset).max(0) as u64)
}

/// Replace every byte outside `[A-Za-z0-9._-]` with `_`
///
/// Used for file names derived from attacker-controlled strings.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Translate bare `\n` into `\r\n` for a terminal peer
pub fn to_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 16);
    let mut prev = 0u8;
    for &b in data {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BUFFER_SIZE, 8192);
        assert_eq!(DEFAULT_CONNECT_TIMEOUT_SECS, 3);
    }

    #[test]
    fn test_jittered_delay_bounds() {
        for _ in 0..200 {
            let d = jittered_delay(1000, 500);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1500));
        }
        assert_eq!(jittered_delay(300, 0), Duration::from_millis(300));
    }

    #[test]
    fn test_jittered_delay_never_negative() {
        for _ in 0..200 {
            assert!(jittered_delay(100, 500) <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("root"), "root");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("a b;c"), "a_b_c");
        assert_eq!(sanitize_file_name(".."), "_");
        assert_eq!(sanitize_file_name(""), "_");
    }

    #[test]
    fn test_to_crlf() {
        assert_eq!(to_crlf(b"a\nb"), b"a\r\nb");
        assert_eq!(to_crlf(b"a\r\nb\n"), b"a\r\nb\r\n");
        assert_eq!(to_crlf(b""), b"");
    }

    #[test]
    fn test_unix_timestamp() {
        assert!(unix_timestamp() > 1_600_000_000);
    }
}
