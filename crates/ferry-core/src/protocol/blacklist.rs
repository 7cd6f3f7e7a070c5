//! Temporary bans for addresses that keep failing

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Default)]
struct Entry {
    failures: VecDeque<Instant>,
    banned_until: Option<Instant>,
}

impl Entry {
    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }
}

/// Failure counter per address with time-boxed bans
#[derive(Clone, Debug, Default)]
pub struct Blacklist {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `address` is banned right now. Expired bans are forgotten
    /// along with the failures that led to them.
    pub fn is_banned(&self, address: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| match entry.banned_until {
            Some(until) => until > now,
            None => !entry.failures.is_empty(),
        });
        entries.get(address).is_some_and(|entry| entry.is_banned(now))
    }

    /// Count one failure. Once more than `threshold` failures fall inside
    /// `window`, the address is banned for `ban`. Returns whether it is now
    /// banned.
    pub fn record_failure(&self, address: &str, threshold: u32, window: Duration, ban: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| {
            entry.is_banned(now) || entry.failures.back().is_some_and(|t| now.duration_since(*t) <= window)
        });
        let entry = entries.entry(address.to_string()).or_default();

        while entry.failures.front().is_some_and(|t| now.duration_since(*t) > window) {
            entry.failures.pop_front();
        }
        entry.failures.push_back(now);

        if entry.failures.len() > threshold as usize {
            entry.banned_until = Some(now + ban);
            entry.failures.clear();
            warn!("Blacklisting {} for {:?} after repeated failures", address, ban);
            return true;
        }
        entry.is_banned(now)
    }

    /// Forget past failures after a success
    pub fn clear(&self, address: &str) {
        self.entries.lock().remove(address);
    }

    /// Addresses currently holding failures or a ban
    pub fn tracked(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ban_after_threshold_then_expire() {
        let list = Blacklist::new();
        let window = Duration::from_secs(10);
        let ban = Duration::from_millis(50);

        assert!(!list.record_failure("10.0.0.1", 2, window, ban));
        assert!(!list.record_failure("10.0.0.1", 2, window, ban));
        assert!(list.record_failure("10.0.0.1", 2, window, ban));
        assert!(list.is_banned("10.0.0.1"));
        assert!(!list.is_banned("10.0.0.2"));

        std::thread::sleep(Duration::from_millis(80));
        assert!(!list.is_banned("10.0.0.1"));
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let list = Blacklist::new();
        let window = Duration::from_millis(20);
        let ban = Duration::from_secs(10);

        list.record_failure("h", 1, window, ban);
        std::thread::sleep(Duration::from_millis(40));
        assert!(!list.record_failure("h", 1, window, ban));
    }

    #[test]
    fn stale_addresses_are_evicted() {
        let list = Blacklist::new();
        let window = Duration::from_millis(20);
        let ban = Duration::from_millis(20);

        for i in 0..50 {
            list.record_failure(&format!("10.0.1.{i}"), 5, window, ban);
        }
        assert!(list.record_failure("10.0.0.9", 0, window, ban));
        assert_eq!(list.tracked(), 51);

        std::thread::sleep(Duration::from_millis(40));
        assert!(!list.is_banned("10.0.0.9"));
        assert_eq!(list.tracked(), 50);

        // Failures older than the window go on the next record.
        list.record_failure("10.0.0.1", 5, window, ban);
        assert_eq!(list.tracked(), 1);
    }

    #[test]
    fn success_clears_the_count() {
        let list = Blacklist::new();
        let window = Duration::from_secs(10);
        let ban = Duration::from_secs(10);

        list.record_failure("h", 1, window, ban);
        list.clear("h");
        assert!(!list.record_failure("h", 1, window, ban));
    }
}
