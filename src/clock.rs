//! Coarse monotonic clock.
//!
//! Voice relaying only needs timestamps good to a few tens of milliseconds,
//! so instead of a syscall per packet the server keeps a millisecond tick
//! behind an atomic, advanced 50 ms at a time by a background task. The
//! dispatcher, the housekeeper and the talkgroup ownership timeout all read
//! the same counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;

const TICK_MS: u64 = 50;

// Start one second in so a freshly authenticated node can never record
// last_seen_sec == 0, which is reserved for "never seen".
const START_MS: u64 = 1000;

/// Shared monotonic tick counter.
///
/// Cheap to clone; all clones observe the same counter. Only the driver
/// task (or `advance` in tests) writes it.
#[derive(Clone)]
pub struct Clock {
    tick_ms: Arc<AtomicU64>,
}

impl Clock {
    /// Creates a clock that does not advance on its own. Tests drive it
    /// with [`Clock::advance`].
    pub fn new() -> Self {
        Self {
            tick_ms: Arc::new(AtomicU64::new(START_MS)),
        }
    }

    /// Creates a clock and spawns the 50 ms driver task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start() -> Self {
        let clock = Self::new();
        let tick_ms = Arc::clone(&clock.tick_ms);
        tokio::spawn(async move {
            let mut interval = time::interval(Duration::from_millis(TICK_MS));
            interval.tick().await; // the first tick completes immediately
            loop {
                interval.tick().await;
                tick_ms.fetch_add(TICK_MS, Ordering::Relaxed);
            }
        });
        clock
    }

    /// Milliseconds since the server started.
    pub fn now_ms(&self) -> u64 {
        self.tick_ms.load(Ordering::Relaxed)
    }

    /// Seconds since the server started.
    pub fn now_sec(&self) -> u64 {
        self.now_ms() / 1000
    }

    /// Advances the tick by hand.
    pub fn advance(&self, ms: u64) {
        self.tick_ms.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_past_second_zero() {
        let clock = Clock::new();
        assert_eq!(clock.now_sec(), 1);
        assert_eq!(clock.now_ms(), 1000);
    }

    #[test]
    fn test_advance() {
        let clock = Clock::new();
        clock.advance(50);
        assert_eq!(clock.now_ms(), 1050);
        assert_eq!(clock.now_sec(), 1);
        clock.advance(950);
        assert_eq!(clock.now_sec(), 2);
    }

    #[test]
    fn test_clones_share_the_counter() {
        let clock = Clock::new();
        let other = clock.clone();
        clock.advance(5000);
        assert_eq!(other.now_ms(), 6000);
    }
}
