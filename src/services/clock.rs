use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// Cancellable periodic ticker. Each poller owns exactly one.
///
/// Missed ticks are skipped, never queued, so a progress query that outlives
/// the interval simply swallows the ticks it overlapped.
pub struct ProgressClock {
    ticker: Interval,
    cancelled: watch::Receiver<bool>,
}

/// Remote control for a [`ProgressClock`]. Cancellation is synchronous and
/// idempotent: once `cancel` returns, no further tick is delivered.
#[derive(Clone)]
pub struct ClockHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ProgressClock {
    pub fn new(period: Duration) -> (Self, ClockHandle) {
        let (tx, rx) = watch::channel(false);
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        (
            Self {
                ticker,
                cancelled: rx,
            },
            ClockHandle { tx: Arc::new(tx) },
        )
    }

    /// Waits for the next tick. Returns `false` once the clock is cancelled.
    pub async fn tick(&mut self) -> bool {
        if *self.cancelled.borrow() {
            return false;
        }
        let cancelled = tokio::select! {
            _ = self.ticker.tick() => false,
            _ = self.cancelled.changed() => true,
        };
        // A cancel can race the winning tick; the flag has the last word.
        !cancelled && !*self.cancelled.borrow()
    }
}

impl ClockHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}
