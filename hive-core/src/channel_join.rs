//! Fleet-global channel-join batcher.
//!
//! Newly connected sessions optionally follow a product newsletter channel.
//! Joins are queued fleet-wide and drained in small batches with generous
//! delays so a burst of reconnects does not turn into a burst of newsletter
//! operations. An already-joined guard makes the hook idempotent per
//! session within its TTL; a session is never re-joined.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::driver::SocketDriver;

/// Queue capacity; excess enqueues are dropped.
pub const QUEUE_CAP: usize = 50;

/// Maximum joins processed per batch.
const BATCH_SIZE: usize = 10;

/// Minimum pause between batches.
const INTER_BATCH_DELAY: Duration = Duration::from_secs(7);

/// Minimum pause between joins inside a batch.
const INTRA_BATCH_DELAY: Duration = Duration::from_secs(3);

/// Queued entries older than this are purged unprocessed.
const STALE_AFTER: Duration = Duration::from_secs(600);

/// Already-joined guard capacity.
const JOINED_CAP: usize = 300;

/// Already-joined guard TTL.
const JOINED_TTL: Duration = Duration::from_secs(3600);

/// Poll cadence while the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Resolves a session id to its live driver, if any.
pub type DriverResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn SocketDriver>> + Send + Sync>;

struct JoinRequest {
    session_id: String,
    enqueued_at: Instant,
}

/// The batcher.
pub struct ChannelJoiner {
    channel_jid: String,
    queue: Mutex<VecDeque<JoinRequest>>,
    joined: Mutex<LruCache<String, Instant>>,
}

impl ChannelJoiner {
    /// Batcher targeting one newsletter jid.
    pub fn new(channel_jid: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channel_jid: channel_jid.into(),
            queue: Mutex::new(VecDeque::new()),
            joined: Mutex::new(LruCache::new(
                NonZeroUsize::new(JOINED_CAP).expect("capacity is non-zero"),
            )),
        })
    }

    /// The target channel.
    pub fn channel_jid(&self) -> &str {
        &self.channel_jid
    }

    /// Queue a session for joining. Returns false when the session already
    /// joined, is already queued, or the queue is full.
    pub fn enqueue(&self, session_id: &str) -> bool {
        if self.recently_joined(session_id) {
            return false;
        }
        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAP {
            tracing::warn!(session_id, "channel join queue full, dropping");
            return false;
        }
        if queue.iter().any(|r| r.session_id == session_id) {
            return false;
        }
        queue.push_back(JoinRequest {
            session_id: session_id.to_string(),
            enqueued_at: Instant::now(),
        });
        true
    }

    /// Queued entry count.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// Whether the guard currently remembers a session as joined.
    pub fn recently_joined(&self, session_id: &str) -> bool {
        self.joined
            .lock()
            .unwrap()
            .peek(session_id)
            .is_some_and(|at| at.elapsed() < JOINED_TTL)
    }

    /// Purge stale queue entries, then process one batch. Returns how many
    /// joins were attempted.
    pub async fn process_batch(&self, resolve: &DriverResolver) -> usize {
        let batch: Vec<String> = {
            let mut queue = self.queue.lock().unwrap();
            queue.retain(|r| r.enqueued_at.elapsed() < STALE_AFTER);
            let take = queue.len().min(BATCH_SIZE);
            queue.drain(..take).map(|r| r.session_id).collect()
        };

        let mut attempted = 0;
        for (i, session_id) in batch.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(INTRA_BATCH_DELAY).await;
            }
            if self.recently_joined(session_id) {
                continue;
            }
            let Some(driver) = resolve(session_id) else {
                tracing::debug!(session_id, "session gone before channel join");
                continue;
            };

            attempted += 1;
            match driver.newsletter_follow(&self.channel_jid).await {
                Ok(()) => {
                    let _ = driver.subscribe_newsletter_updates(&self.channel_jid).await;
                    let _ = driver.newsletter_unmute(&self.channel_jid).await;
                    self.joined
                        .lock()
                        .unwrap()
                        .put(session_id.clone(), Instant::now());
                    tracing::info!(session_id, channel = self.channel_jid, "channel joined");
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "channel join failed");
                }
            }
        }
        attempted
    }

    /// Drain the queue until cancelled.
    pub fn spawn_worker(self: &Arc<Self>, resolve: DriverResolver, cancel: CancellationToken) {
        let joiner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if joiner.queue_len() == 0 {
                    tokio::select! {
                        () = tokio::time::sleep(IDLE_POLL) => continue,
                        () = cancel.cancelled() => return,
                    }
                }
                joiner.process_batch(&resolve).await;
                tokio::select! {
                    () = tokio::time::sleep(INTER_BATCH_DELAY) => {}
                    () = cancel.cancelled() => return,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use std::collections::HashMap;

    fn resolver_for(drivers: HashMap<String, Arc<MockDriver>>) -> DriverResolver {
        Arc::new(move |session_id| {
            drivers
                .get(session_id)
                .map(|d| Arc::clone(d) as Arc<dyn SocketDriver>)
        })
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates() {
        let joiner = ChannelJoiner::new("chan@newsletter");
        assert!(joiner.enqueue("session_1"));
        assert!(!joiner.enqueue("session_1"), "duplicate queued entry");
        assert_eq!(joiner.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_queue_cap_enforced() {
        let joiner = ChannelJoiner::new("chan@newsletter");
        for i in 0..QUEUE_CAP {
            assert!(joiner.enqueue(&format!("session_{i}")));
        }
        assert!(!joiner.enqueue("session_overflow"));
        assert_eq!(joiner.queue_len(), QUEUE_CAP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_joins_and_guards() {
        let joiner = ChannelJoiner::new("chan@newsletter");
        let driver = MockDriver::new();
        let resolve = resolver_for(HashMap::from([(
            "session_1".to_string(),
            Arc::clone(&driver),
        )]));

        joiner.enqueue("session_1");
        let attempted = joiner.process_batch(&resolve).await;

        assert_eq!(attempted, 1);
        assert_eq!(driver.followed(), vec!["chan@newsletter".to_string()]);
        assert!(joiner.recently_joined("session_1"));

        // Never rejoin: the guard blocks the next enqueue entirely.
        assert!(!joiner.enqueue("session_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_limited_to_batch_size() {
        let joiner = ChannelJoiner::new("chan@newsletter");
        let mut drivers = HashMap::new();
        for i in 0..15 {
            let driver = MockDriver::new();
            drivers.insert(format!("session_{i}"), driver);
            joiner.enqueue(&format!("session_{i}"));
        }
        let resolve = resolver_for(drivers);

        let attempted = joiner.process_batch(&resolve).await;
        assert_eq!(attempted, 10, "one batch is at most ten joins");
        assert_eq!(joiner.queue_len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_purged() {
        let joiner = ChannelJoiner::new("chan@newsletter");
        joiner.enqueue("session_old");
        tokio::time::advance(STALE_AFTER + Duration::from_secs(1)).await;
        joiner.enqueue("session_fresh");

        let driver = MockDriver::new();
        let resolve = resolver_for(HashMap::from([(
            "session_fresh".to_string(),
            Arc::clone(&driver),
        )]));

        let attempted = joiner.process_batch(&resolve).await;
        assert_eq!(attempted, 1, "stale entry purged before processing");
        assert!(!joiner.recently_joined("session_old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_session_skipped() {
        let joiner = ChannelJoiner::new("chan@newsletter");
        joiner.enqueue("session_gone");
        let resolve = resolver_for(HashMap::new());

        let attempted = joiner.process_batch(&resolve).await;
        assert_eq!(attempted, 0);
        assert!(!joiner.recently_joined("session_gone"));
    }
}
