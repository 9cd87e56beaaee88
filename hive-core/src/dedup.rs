//! Cross-session deduplication ledger.
//!
//! When several hosted sessions observe the same inbound group message, only
//! one of them may perform a given side-effect. The ledger hands out short
//! leases per `(chat, message) × action` and remembers completions, giving
//! at-most-once semantics inside its TTL windows.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long an entry lives before the sweeper may drop it.
pub const ENTRY_TTL: Duration = Duration::from_secs(30);

/// A lock older than this may be taken over by another session.
pub const LOCK_MAX_AGE: Duration = Duration::from_secs(15);

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Hard cap on tracked entries; oldest evicted first.
const MAX_ENTRIES: usize = 300;

/// Ledger key: one inbound message in one chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// Chat jid.
    pub chat_id: String,
    /// Message id.
    pub message_id: String,
}

impl DedupKey {
    /// Convenience constructor.
    pub fn new(chat_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            message_id: message_id.into(),
        }
    }
}

#[derive(Debug)]
struct ActionLock {
    session_id: String,
    locked_at: Instant,
}

#[derive(Debug)]
struct Entry {
    created_at: Instant,
    locks: HashMap<String, ActionLock>,
    done: HashSet<String>,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            locks: HashMap::new(),
            done: HashSet::new(),
        }
    }
}

/// The fleet-wide ledger. Cheap to share; all access is through one mutex.
pub struct DedupLedger {
    entries: Mutex<HashMap<DedupKey, Entry>>,
}

impl DedupLedger {
    /// Empty ledger.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Try to acquire the lease for `action` on `key`.
    ///
    /// Returns `true` iff the calling session may proceed: the action is not
    /// completed and no other session holds a lock younger than
    /// [`LOCK_MAX_AGE`]. A session re-requesting its own fresh lock proceeds.
    /// Ties between contenders for an expired lock go to arrival order.
    pub fn try_lock(&self, key: &DedupKey, session_id: &str, action: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        Self::evict_if_full(&mut entries, key);
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(now));

        if entry.done.contains(action) {
            return false;
        }

        match entry.locks.get(action) {
            Some(lock)
                if lock.session_id != session_id
                    && now.duration_since(lock.locked_at) < LOCK_MAX_AGE =>
            {
                false
            }
            _ => {
                entry.locks.insert(
                    action.to_string(),
                    ActionLock {
                        session_id: session_id.to_string(),
                        locked_at: now,
                    },
                );
                true
            }
        }
    }

    /// Record that `action` completed for `key`. Idempotent; releases the
    /// lock so late contenders observe the completion instead.
    pub fn mark_done(&self, key: &DedupKey, session_id: &str, action: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        Self::evict_if_full(&mut entries, key);
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(now));

        entry.done.insert(action.to_string());
        if entry
            .locks
            .get(action)
            .is_some_and(|l| l.session_id == session_id)
        {
            entry.locks.remove(action);
        }
    }

    /// Whether `action` already completed for `key`.
    pub fn is_done(&self, key: &DedupKey, action: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .is_some_and(|e| e.done.contains(action))
    }

    /// Drop entries older than [`ENTRY_TTL`]. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.created_at) < ENTRY_TTL);
        before - entries.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the periodic sweep until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = ledger.sweep();
                        if removed > 0 {
                            tracing::trace!(removed, "dedup ledger swept");
                        }
                    }
                    () = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Make room before inserting a new key: evict the oldest entries while
    /// at capacity. The key being touched is never evicted.
    fn evict_if_full(entries: &mut HashMap<DedupKey, Entry>, touched: &DedupKey) {
        while entries.len() >= MAX_ENTRIES && !entries.contains_key(touched) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> DedupKey {
        DedupKey::new("group@g.us", id)
    }

    #[tokio::test]
    async fn test_first_session_wins_lock() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        assert!(ledger.try_lock(&k, "session_a", "anti-link"));
        assert!(!ledger.try_lock(&k, "session_b", "anti-link"));
    }

    #[tokio::test]
    async fn test_same_session_may_reacquire() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        assert!(ledger.try_lock(&k, "session_a", "anti-link"));
        assert!(ledger.try_lock(&k, "session_a", "anti-link"));
    }

    #[tokio::test]
    async fn test_actions_are_independent() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        assert!(ledger.try_lock(&k, "session_a", "anti-link"));
        assert!(ledger.try_lock(&k, "session_b", "anti-spam"));
    }

    #[tokio::test]
    async fn test_done_action_blocks_everyone() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        assert!(ledger.try_lock(&k, "session_a", "db-update"));
        ledger.mark_done(&k, "session_a", "db-update");

        assert!(!ledger.try_lock(&k, "session_a", "db-update"));
        assert!(!ledger.try_lock(&k, "session_b", "db-update"));
        assert!(ledger.is_done(&k, "db-update"));
        assert!(!ledger.is_done(&k, "other"));
    }

    #[tokio::test]
    async fn test_mark_done_is_idempotent() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        ledger.mark_done(&k, "session_a", "db-update");
        ledger.mark_done(&k, "session_a", "db-update");

        assert!(ledger.is_done(&k, "db-update"));
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_can_be_taken_over() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        assert!(ledger.try_lock(&k, "session_a", "anti-link"));
        assert!(!ledger.try_lock(&k, "session_b", "anti-link"));

        tokio::time::advance(LOCK_MAX_AGE + Duration::from_secs(1)).await;
        assert!(ledger.try_lock(&k, "session_b", "anti-link"));
        // And the takeover renews exclusivity.
        assert!(!ledger.try_lock(&k, "session_c", "anti-link"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_entries() {
        let ledger = DedupLedger::new();
        ledger.try_lock(&key("M1"), "session_a", "anti-link");

        tokio::time::advance(Duration::from_secs(10)).await;
        ledger.try_lock(&key("M2"), "session_a", "anti-link");

        tokio::time::advance(Duration::from_secs(25)).await;
        let removed = ledger.sweep();

        assert_eq!(removed, 1, "only the 35s-old entry expires");
        assert_eq!(ledger.len(), 1);
        assert!(!ledger.is_done(&key("M1"), "anti-link"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let ledger = DedupLedger::new();
        for i in 0..MAX_ENTRIES {
            ledger.try_lock(&key(&format!("M{i}")), "session_a", "anti-link");
            // Distinct creation instants so eviction order is well-defined.
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(ledger.len(), MAX_ENTRIES);

        ledger.try_lock(&key("overflow"), "session_a", "anti-link");
        assert_eq!(ledger.len(), MAX_ENTRIES);

        // M0 was the oldest entry; its lock state is gone, so another
        // session can immediately take the action.
        assert!(ledger.try_lock(&key("M0"), "session_b", "anti-link"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_winner_within_window() {
        let ledger = DedupLedger::new();
        let k = key("M1");

        let winners: usize = ["session_a", "session_b", "session_c"]
            .iter()
            .filter(|sid| ledger.try_lock(&k, sid, "anti-badword"))
            .count();
        assert_eq!(winners, 1);
    }
}
