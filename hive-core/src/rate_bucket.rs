//! Process-wide outbound scheduler.
//!
//! All SocketDriver-facing operations funnel through one [`RateBucket`]: a
//! serial FIFO per operation class with a minimum gap between operations.
//! This absorbs bursts across every hosted session and keeps the fleet under
//! the remote rate limits. Cross-class operations do not wait on each other.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum pause between two operations of the same class.
pub const DEFAULT_GAP: Duration = Duration::from_millis(500);

/// Operation classes with independent lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Message sends.
    Send,
    /// Group metadata fetches.
    Metadata,
    /// Newsletter operations (channel joins).
    Newsletter,
}

/// One lane: the completion time of the most recent operation.
#[derive(Default)]
struct Lane {
    last_done: Option<Instant>,
}

/// Serial FIFO with a fixed inter-op delay per class.
///
/// Waiters queue on the lane mutex; tokio mutexes wake in FIFO order, which
/// is the ordering guarantee the outbound path relies on.
pub struct RateBucket {
    gap: Duration,
    send: Mutex<Lane>,
    metadata: Mutex<Lane>,
    newsletter: Mutex<Lane>,
}

impl RateBucket {
    /// Bucket with the default 500 ms gap.
    pub fn new() -> Self {
        Self::with_gap(DEFAULT_GAP)
    }

    /// Bucket with a custom gap (tests use small gaps).
    pub fn with_gap(gap: Duration) -> Self {
        Self {
            gap,
            send: Mutex::new(Lane::default()),
            metadata: Mutex::new(Lane::default()),
            newsletter: Mutex::new(Lane::default()),
        }
    }

    fn lane(&self, class: OpClass) -> &Mutex<Lane> {
        match class {
            OpClass::Send => &self.send,
            OpClass::Metadata => &self.metadata,
            OpClass::Newsletter => &self.newsletter,
        }
    }

    /// Run `op` in its class lane, waiting out the gap first.
    ///
    /// The lane is held for the duration of the operation, so operations of
    /// one class never overlap and always start at least `gap` after the
    /// previous one finished.
    pub async fn run<F, T>(&self, class: OpClass, op: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut lane = self.lane(class).lock().await;
        if let Some(last) = lane.last_done {
            let since = last.elapsed();
            if since < self.gap {
                tokio::time::sleep(self.gap - since).await;
            }
        }
        let out = op.await;
        lane.last_done = Some(Instant::now());
        out
    }
}

impl Default for RateBucket {
    fn default() -> Self {
        Self::new()
    }
}
