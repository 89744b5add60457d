// Path: crates/pairing/src/rate_limit.rs
//! Per-source-address throttling for the pairing exchange endpoint.

use gantry_types::error::PairingError;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Attempts allowed inside one window before a ban fires.
const MAX_ATTEMPTS_PER_WINDOW: usize = 5;
/// The sliding attempt window.
const WINDOW: Duration = Duration::from_secs(60);
/// Ban length once the budget is exceeded.
const BAN: Duration = Duration::from_secs(15 * 60);
/// Quiescence after the ban window before an entry is dropped.
const QUIESCENCE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct SourceEntry {
    attempts: VecDeque<Instant>,
    banned_until: Option<Instant>,
    last_activity: Instant,
}

/// Sliding-window rate limiter keyed by source address.
#[derive(Debug, Default)]
pub struct RateLimiter {
    sources: HashMap<String, SourceEntry>,
}

impl RateLimiter {
    /// An empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attempt from `source` at `now`. The sixth attempt
    /// inside one window is rejected and starts the ban; every attempt
    /// during the ban is rejected with the remaining time.
    pub fn check(&mut self, source: &str, now: Instant) -> Result<(), PairingError> {
        self.purge(now);

        let entry = self
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceEntry {
                attempts: VecDeque::new(),
                banned_until: None,
                last_activity: now,
            });
        entry.last_activity = now;

        if let Some(until) = entry.banned_until {
            if now < until {
                return Err(PairingError::RateLimited {
                    retry_after_secs: (until - now).as_secs().max(1),
                });
            }
            entry.banned_until = None;
            entry.attempts.clear();
        }

        while let Some(&front) = entry.attempts.front() {
            if now.duration_since(front) >= WINDOW {
                entry.attempts.pop_front();
            } else {
                break;
            }
        }

        entry.attempts.push_back(now);
        if entry.attempts.len() > MAX_ATTEMPTS_PER_WINDOW {
            let until = now + BAN;
            entry.banned_until = Some(until);
            tracing::warn!(source, "pairing rate limit exceeded; source banned");
            return Err(PairingError::RateLimited {
                retry_after_secs: BAN.as_secs(),
            });
        }
        Ok(())
    }

    /// Drops entries whose ban has lapsed and that have been quiet for
    /// the quiescence window.
    fn purge(&mut self, now: Instant) {
        self.sources.retain(|_, entry| {
            if let Some(until) = entry.banned_until {
                if now < until {
                    return true;
                }
            }
            now.duration_since(entry.last_activity) < QUIESCENCE
        });
    }

    #[cfg(test)]
    fn tracked_sources(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sixth_attempt_in_window_is_banned() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();

        for i in 0..5 {
            let at = start + Duration::from_secs(i * 2);
            assert!(limiter.check("10.0.0.9", at).is_ok(), "attempt {i}");
        }
        let sixth = limiter.check("10.0.0.9", start + Duration::from_secs(10));
        assert!(matches!(sixth, Err(PairingError::RateLimited { .. })));

        // Attempts 7+ stay rejected until the ban lapses.
        let seventh = limiter.check("10.0.0.9", start + Duration::from_secs(11));
        assert!(matches!(seventh, Err(PairingError::RateLimited { .. })));
        let after_ban = limiter.check("10.0.0.9", start + BAN + Duration::from_secs(11));
        assert!(after_ban.is_ok());
    }

    #[test]
    fn slow_attempts_never_trip() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();
        for i in 0..20u64 {
            let at = start + Duration::from_secs(i * 15);
            assert!(limiter.check("10.0.0.7", at).is_ok());
        }
    }

    #[test]
    fn sources_are_independent() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..6 {
            let _ = limiter.check("10.0.0.1", now);
        }
        assert!(limiter.check("10.0.0.2", now).is_ok());
    }

    #[test]
    fn quiescent_entries_are_purged() {
        let mut limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.check("10.0.0.3", start).unwrap();
        assert_eq!(limiter.tracked_sources(), 1);

        // A later check from another source triggers the purge pass.
        limiter
            .check("10.0.0.4", start + QUIESCENCE + Duration::from_secs(1))
            .unwrap();
        assert_eq!(limiter.tracked_sources(), 1);
    }
}
