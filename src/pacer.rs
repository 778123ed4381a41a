//! Minimum spacing between page requests
//!
//! The RequestPacer keeps a session from hammering the remote service between
//! throttle signals. It is a lock-free slot reservation: every caller atomically
//! claims the next free send slot and sleeps until it arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lock-free gate that spaces requests at least `interval` apart
///
/// Clones share the same schedule, so one pacer can also be shared by several
/// tasks that must stay under a common request rate.
///
/// # Implementation
///
/// - `interval_nanos`: minimum spacing in nanoseconds (0 = no pacing)
/// - `next_slot`: earliest time the next request may be sent (nanoseconds since
///   an arbitrary process-wide epoch)
#[derive(Clone, Debug)]
pub struct RequestPacer {
    interval_nanos: Arc<AtomicU64>,
    next_slot: Arc<AtomicU64>,
}

impl RequestPacer {
    /// Create a pacer; `Duration::ZERO` disables pacing
    ///
    /// # Examples
    ///
    /// ```
    /// use stream_harvest::pacer::RequestPacer;
    /// use std::time::Duration;
    ///
    /// let pacer = RequestPacer::new(Duration::from_millis(500));
    /// assert_eq!(pacer.interval(), Duration::from_millis(500));
    /// ```
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_nanos: Arc::new(AtomicU64::new(interval.as_nanos() as u64)),
            next_slot: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Current minimum spacing
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    /// Change the spacing; takes effect from the next reservation
    pub fn set_interval(&self, interval: Duration) {
        self.interval_nanos
            .store(interval.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Wait until the caller may send its next request
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Claim the next slot and return how long until it opens
    fn reserve(&self) -> Duration {
        let interval = self.interval_nanos.load(Ordering::Relaxed);
        if interval == 0 {
            return Duration::ZERO;
        }

        loop {
            let now = Self::now_nanos();
            let next = self.next_slot.load(Ordering::SeqCst);
            let slot = next.max(now);

            if self
                .next_slot
                .compare_exchange(next, slot + interval, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Duration::from_nanos(slot - now);
            }
            // Another caller claimed the slot first; retry against the new schedule
        }
    }

    /// Monotonic time in nanoseconds since a process-wide epoch
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}
