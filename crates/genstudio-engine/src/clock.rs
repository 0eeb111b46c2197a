use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(100);

/// Source of delays for retry backoff and job polling.
pub trait Sleeper: Send + Sync {
    /// Sleeps for `duration`, returning early with `false` if `cancel`
    /// fires. Returns `true` when the full duration elapsed.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }
            let slice = remaining.min(CANCEL_CHECK_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        !cancel.is_cancelled()
    }
}

/// Records requested delays without waiting.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if let Ok(mut rows) = self.delays.lock() {
            rows.push(duration);
        }
        !cancel.is_cancelled()
    }
}

/// Explicit cancellation passed into long-running calls.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn thread_sleeper_stops_early_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let started = Instant::now();
        assert!(!ThreadSleeper.sleep(Duration::from_secs(5), &token));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn thread_sleeper_completes_short_sleep() {
        let token = CancellationToken::new();
        assert!(ThreadSleeper.sleep(Duration::from_millis(5), &token));
    }

    #[test]
    fn recording_sleeper_keeps_order() {
        let sleeper = RecordingSleeper::new();
        let token = CancellationToken::new();
        sleeper.sleep(Duration::from_secs(1), &token);
        sleeper.sleep(Duration::from_secs(2), &token);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn token_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
