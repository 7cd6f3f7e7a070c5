//! Two-tier traffic shaping for channel I/O
//!
//! A process-wide [`BandwidthLimiter`] holds the global read/write buckets
//! and the current caps. Each logical channel gets a [`SessionShaper`] with
//! its own buckets; a transfer waits until both tiers have budget, so the
//! effective cap is the smaller of the two. Limits can change at any time
//! and open sessions follow on their next acquire.

use ferry_types::BandwidthLimit;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Read,
    Write,
}

/// Token bucket holding at most one check interval worth of bytes
#[derive(Debug)]
struct Bucket {
    /// Bytes per second, zero for unlimited
    rate: u64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    // Starts empty so the very first interval is shaped too.
    fn new(rate: u64) -> Self {
        Self {
            rate,
            tokens: 0.0,
            last_refill: Instant::now(),
        }
    }

    fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    fn set_rate(&mut self, rate: u64) {
        if rate != self.rate {
            self.rate = rate;
            self.tokens = 0.0;
            self.last_refill = Instant::now();
        }
    }

    fn capacity(&self, interval: Duration) -> f64 {
        (self.rate as f64 * interval.as_secs_f64()).max(1.0)
    }

    fn refill(&mut self, now: Instant, interval: Duration) {
        if self.is_unlimited() {
            self.last_refill = now;
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.capacity(interval));
        self.last_refill = now;
    }

    fn consume(&mut self, bytes: f64) {
        if !self.is_unlimited() {
            self.tokens -= bytes;
        }
    }

    /// Time until `needed` bytes (bounded by capacity) are available
    fn time_for(&self, needed: f64, interval: Duration) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let target = needed.min(self.capacity(interval));
        let deficit = (target - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.rate as f64)
    }
}

#[derive(Debug)]
struct Shared {
    limits: RwLock<BandwidthLimit>,
    read: Mutex<Bucket>,
    write: Mutex<Bucket>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

/// Global tier, shared by every channel of the process
#[derive(Clone, Debug)]
pub struct BandwidthLimiter {
    shared: Arc<Shared>,
}

impl BandwidthLimiter {
    pub fn new(limit: BandwidthLimit) -> Self {
        Self {
            shared: Arc::new(Shared {
                read: Mutex::new(Bucket::new(limit.global_read)),
                write: Mutex::new(Bucket::new(limit.global_write)),
                limits: RwLock::new(limit),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(BandwidthLimit::unlimited())
    }

    pub fn limits(&self) -> BandwidthLimit {
        *self.shared.limits.read()
    }

    /// Replace all four caps and the check interval
    pub fn change_network_limit(&self, limit: BandwidthLimit) {
        *self.shared.limits.write() = limit;
        self.shared.read.lock().set_rate(limit.global_read);
        self.shared.write.lock().set_rate(limit.global_write);
        info!(
            "Bandwidth limits changed: global r/w {}/{} B/s, session r/w {}/{} B/s, interval {} ms",
            limit.global_read,
            limit.global_write,
            limit.session_read,
            limit.session_write,
            limit.check_interval_ms
        );
    }

    /// New per-channel shaper. `rule_limit` overrides the session caps when
    /// it sets them.
    pub fn session(&self, rule_limit: Option<BandwidthLimit>) -> SessionShaper {
        let (read, write) = session_rates(&self.limits(), rule_limit.as_ref());
        SessionShaper {
            global: self.clone(),
            rule_limit,
            read: Mutex::new(Bucket::new(read)),
            write: Mutex::new(Bucket::new(write)),
        }
    }

    /// Bytes read and written through every session so far
    pub fn totals(&self) -> (u64, u64) {
        (
            self.shared.bytes_read.load(Ordering::Relaxed),
            self.shared.bytes_written.load(Ordering::Relaxed),
        )
    }

    fn check_interval(&self) -> Duration {
        Duration::from_millis(self.shared.limits.read().check_interval_ms).max(MIN_CHECK_INTERVAL)
    }

    fn bucket(&self, axis: Axis) -> &Mutex<Bucket> {
        match axis {
            Axis::Read => &self.shared.read,
            Axis::Write => &self.shared.write,
        }
    }

    fn account(&self, axis: Axis, bytes: u64) {
        let counter = match axis {
            Axis::Read => &self.shared.bytes_read,
            Axis::Write => &self.shared.bytes_written,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }
}

fn session_rates(limits: &BandwidthLimit, rule_limit: Option<&BandwidthLimit>) -> (u64, u64) {
    let pick = |global: u64, rule: Option<u64>| rule.filter(|r| *r > 0).unwrap_or(global);
    (
        pick(limits.session_read, rule_limit.map(|r| r.session_read)),
        pick(limits.session_write, rule_limit.map(|r| r.session_write)),
    )
}

/// Per-channel tier
#[derive(Debug)]
pub struct SessionShaper {
    global: BandwidthLimiter,
    rule_limit: Option<BandwidthLimit>,
    read: Mutex<Bucket>,
    write: Mutex<Bucket>,
}

impl SessionShaper {
    /// Wait until `bytes` may be read
    pub async fn acquire_read(&self, bytes: u64) {
        self.acquire(Axis::Read, bytes).await
    }

    /// Wait until `bytes` may be written
    pub async fn acquire_write(&self, bytes: u64) {
        self.acquire(Axis::Write, bytes).await
    }

    pub async fn acquire(&self, axis: Axis, bytes: u64) {
        self.global.account(axis, bytes);
        let mut remaining = bytes as f64;

        while remaining >= 1.0 {
            let wait = {
                let interval = self.global.check_interval();
                let (read_rate, write_rate) = session_rates(&self.global.limits(), self.rule_limit.as_ref());
                let session_rate = match axis {
                    Axis::Read => read_rate,
                    Axis::Write => write_rate,
                };

                let mut global = self.global.bucket(axis).lock();
                let mut session = self.bucket(axis).lock();
                session.set_rate(session_rate);

                if global.is_unlimited() && session.is_unlimited() {
                    return;
                }

                let now = Instant::now();
                global.refill(now, interval);
                session.refill(now, interval);

                let available = match (global.is_unlimited(), session.is_unlimited()) {
                    (false, true) => global.tokens,
                    (true, false) => session.tokens,
                    _ => global.tokens.min(session.tokens),
                };
                let take = available.floor().min(remaining);
                if take >= 1.0 {
                    global.consume(take);
                    session.consume(take);
                    remaining -= take;
                }
                if remaining < 1.0 {
                    return;
                }

                global
                    .time_for(remaining, interval)
                    .max(session.time_for(remaining, interval))
                    .clamp(MIN_WAIT, interval)
            };

            // Sleep outside the locks so sibling channels keep flowing.
            tokio::time::sleep(wait).await;
        }
    }

    fn bucket(&self, axis: Axis) -> &Mutex<Bucket> {
        match axis {
            Axis::Read => &self.read,
            Axis::Write => &self.write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit(global_write: u64, session_write: u64, interval_ms: u64) -> BandwidthLimit {
        BandwidthLimit {
            global_write,
            session_write,
            check_interval_ms: interval_ms,
            ..BandwidthLimit::default()
        }
    }

    #[tokio::test]
    async fn unlimited_does_not_wait() {
        let limiter = BandwidthLimiter::unlimited();
        let session = limiter.session(None);

        let start = Instant::now();
        for _ in 0..100 {
            session.acquire_write(1_000_000).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.totals().1, 100_000_000);
    }

    #[tokio::test]
    async fn session_cap_shapes_writes() {
        let limiter = BandwidthLimiter::new(limit(0, 10_000, 100));
        let session = limiter.session(None);

        let start = Instant::now();
        for _ in 0..5 {
            session.acquire_write(1000).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "too slow: {elapsed:?}");
    }

    #[tokio::test]
    async fn global_cap_is_shared_between_sessions() {
        let limiter = BandwidthLimiter::new(limit(10_000, 0, 100));
        let a = limiter.session(None);
        let b = limiter.session(None);

        let start = Instant::now();
        tokio::join!(a.acquire_write(2500), b.acquire_write(2500));
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn reads_are_not_limited_by_write_caps() {
        let limiter = BandwidthLimiter::new(limit(100, 100, 100));
        let session = limiter.session(None);

        let start = Instant::now();
        session.acquire_read(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn limit_change_reaches_open_sessions() {
        let limiter = BandwidthLimiter::new(limit(0, 1000, 50));
        let session = Arc::new(limiter.session(None));

        let start = Instant::now();
        let task = {
            let session = session.clone();
            tokio::spawn(async move { session.acquire_write(100_000).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        limiter.change_network_limit(BandwidthLimit::unlimited());
        task.await.unwrap();

        // 100 kB at 1 kB/s would take well over a minute.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn rule_override_replaces_session_caps() {
        let limiter = BandwidthLimiter::new(BandwidthLimit::unlimited());
        let session = limiter.session(Some(limit(0, 10_000, 100)));

        let start = Instant::now();
        session.acquire_write(3000).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
