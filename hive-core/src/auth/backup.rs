//! Asynchronous backup pipeline for auth records.
//!
//! Every primary-tier write enqueues a task here; nothing in the hot path
//! ever waits on the secondary. Tasks are drained in bounded batches with a
//! per-record timeout, and a periodic probe tracks secondary health so
//! pre-key churn can be shed while the backend is down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::KeyKind;
use super::secondary::SecondaryStore;

/// Maximum records per drain batch.
const BATCH_LIMIT: usize = 90;

/// Minimum pause between batches.
const BATCH_GAP: Duration = Duration::from_millis(20);

/// Per-record operation bound.
const RECORD_TIMEOUT: Duration = Duration::from_secs(3);

/// Health probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Consecutive timeouts before the secondary is considered down.
const UNHEALTHY_THRESHOLD: u32 = 3;

/// What kind of record a backup task carries, for suppression decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    /// The creds record. Always backed up.
    Creds,
    /// A key record of the given kind.
    Key(KeyKind),
}

impl BackupKind {
    fn is_pre_key(self) -> bool {
        matches!(self, BackupKind::Key(KeyKind::PreKey))
    }
}

/// One queued backup operation.
#[derive(Debug)]
enum BackupTask {
    Upsert {
        session_id: String,
        file_name: String,
        payload: serde_json::Value,
    },
    Delete {
        session_id: String,
        file_name: String,
    },
}

/// Shared secondary-health state.
#[derive(Debug, Default)]
pub struct BackupHealth {
    consecutive_timeouts: AtomicU32,
    unhealthy: AtomicBool,
    dropped: AtomicU64,
    completed: AtomicU64,
}

impl BackupHealth {
    /// Whether the secondary is currently considered reachable.
    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    /// Total tasks dropped by suppression or channel closure.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Total tasks that reached the secondary.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    fn record_timeout(&self) {
        let seen = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        if seen >= UNHEALTHY_THRESHOLD && !self.unhealthy.swap(true, Ordering::SeqCst) {
            tracing::warn!(consecutive = seen, "secondary auth store marked unhealthy");
        }
    }

    fn record_success(&self) {
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        if self.unhealthy.swap(false, Ordering::SeqCst) {
            tracing::info!("secondary auth store healthy again");
        }
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handle for enqueuing fire-and-forget backups.
///
/// Cloning is cheap; all clones feed one worker.
#[derive(Clone)]
pub struct BackupQueue {
    tx: mpsc::UnboundedSender<BackupTask>,
    health: Arc<BackupHealth>,
    /// In file mode pre-key backups are shed while the secondary is down;
    /// creds and other record kinds keep flowing.
    suppress_pre_keys_when_unhealthy: bool,
}

impl BackupQueue {
    /// Start the worker and probe tasks against a secondary store.
    pub fn start(
        secondary: Arc<dyn SecondaryStore>,
        suppress_pre_keys_when_unhealthy: bool,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let health = Arc::new(BackupHealth::default());

        tokio::spawn(run_worker(
            rx,
            Arc::clone(&secondary),
            Arc::clone(&health),
            cancel.clone(),
        ));
        tokio::spawn(run_probe(secondary, Arc::clone(&health), cancel));

        Self {
            tx,
            health,
            suppress_pre_keys_when_unhealthy,
        }
    }

    /// Health view, shared with the worker and probe.
    pub fn health(&self) -> &Arc<BackupHealth> {
        &self.health
    }

    /// Queue a record upsert. Never blocks, never fails the caller.
    pub fn enqueue_upsert(
        &self,
        session_id: &str,
        file_name: &str,
        payload: serde_json::Value,
        kind: BackupKind,
    ) {
        if self.should_suppress(kind) {
            self.health.record_drop();
            tracing::debug!(session_id, file_name, "pre-key backup suppressed while secondary unhealthy");
            return;
        }
        let task = BackupTask::Upsert {
            session_id: session_id.to_string(),
            file_name: file_name.to_string(),
            payload,
        };
        if self.tx.send(task).is_err() {
            self.health.record_drop();
        }
    }

    /// Queue a record deletion.
    pub fn enqueue_delete(&self, session_id: &str, file_name: &str, kind: BackupKind) {
        if self.should_suppress(kind) {
            self.health.record_drop();
            return;
        }
        let task = BackupTask::Delete {
            session_id: session_id.to_string(),
            file_name: file_name.to_string(),
        };
        if self.tx.send(task).is_err() {
            self.health.record_drop();
        }
    }

    fn should_suppress(&self, kind: BackupKind) -> bool {
        self.suppress_pre_keys_when_unhealthy && kind.is_pre_key() && !self.health.is_healthy()
    }
}

/// Drain the queue in batches of at most [`BATCH_LIMIT`], pausing
/// [`BATCH_GAP`] between batches.
async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<BackupTask>,
    secondary: Arc<dyn SecondaryStore>,
    health: Arc<BackupHealth>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            task = rx.recv() => match task {
                Some(task) => task,
                None => return,
            },
            () = cancel.cancelled() => return,
        };

        let mut batch = vec![first];
        while batch.len() < BATCH_LIMIT {
            match rx.try_recv() {
                Ok(task) => batch.push(task),
                Err(_) => break,
            }
        }

        let batch_len = batch.len();
        for task in batch {
            run_task(task, secondary.as_ref(), &health).await;
        }
        tracing::trace!(count = batch_len, "backup batch flushed");

        tokio::select! {
            () = tokio::time::sleep(BATCH_GAP) => {}
            () = cancel.cancelled() => return,
        }
    }
}

/// Execute one task under the per-record timeout. Failures are accounted,
/// never retried.
async fn run_task(task: BackupTask, secondary: &dyn SecondaryStore, health: &BackupHealth) {
    let result = match &task {
        BackupTask::Upsert {
            session_id,
            file_name,
            payload,
        } => {
            tokio::time::timeout(RECORD_TIMEOUT, secondary.upsert(session_id, file_name, payload))
                .await
        }
        BackupTask::Delete {
            session_id,
            file_name,
        } => tokio::time::timeout(RECORD_TIMEOUT, secondary.delete(session_id, file_name)).await,
    };

    match result {
        Ok(Ok(())) => {
            health.record_success();
            health.record_completed();
        }
        Ok(Err(e)) => {
            health.record_drop();
            tracing::debug!(error = %e, "backup write failed");
        }
        Err(_) => {
            health.record_timeout();
            health.record_drop();
            tracing::debug!("backup write timed out");
        }
    }
}

/// Probe the secondary every [`PROBE_INTERVAL`] so health recovers (or
/// degrades) even when no writes are flowing.
async fn run_probe(
    secondary: Arc<dyn SecondaryStore>,
    health: Arc<BackupHealth>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would double-probe right after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match tokio::time::timeout(RECORD_TIMEOUT, secondary.ping()).await {
                    Ok(Ok(())) => health.record_success(),
                    Ok(Err(e)) => {
                        tracing::debug!(error = %e, "secondary probe failed");
                        health.record_timeout();
                    }
                    Err(_) => health.record_timeout(),
                }
            }
            () = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::secondary::MemorySecondaryStore;
    use serde_json::json;

    fn queue_over(
        store: &Arc<MemorySecondaryStore>,
        suppress: bool,
    ) -> (BackupQueue, CancellationToken) {
        let cancel = CancellationToken::new();
        let queue = BackupQueue::start(
            Arc::clone(store) as Arc<dyn SecondaryStore>,
            suppress,
            cancel.clone(),
        );
        (queue, cancel)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_upsert_reaches_secondary() {
        let store = Arc::new(MemorySecondaryStore::new());
        let (queue, cancel) = queue_over(&store, false);

        queue.enqueue_upsert(
            "session_1",
            "creds.json",
            json!({"registered": true}),
            BackupKind::Creds,
        );

        wait_for(|| store.record("session_1", "creds.json").is_some()).await;
        assert_eq!(queue.health().completed(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_delete_reaches_secondary() {
        let store = Arc::new(MemorySecondaryStore::new());
        store.seed("session_1", "pre-key-9.json", json!({"x": 1}));
        let (queue, cancel) = queue_over(&store, false);

        queue.enqueue_delete("session_1", "pre-key-9.json", BackupKind::Key(KeyKind::PreKey));

        wait_for(|| store.record("session_1", "pre-key-9.json").is_none()).await;
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_mark_unhealthy() {
        let store = Arc::new(MemorySecondaryStore::new());
        store.stall(true);
        let (queue, cancel) = queue_over(&store, false);

        for i in 0..UNHEALTHY_THRESHOLD {
            queue.enqueue_upsert(
                "session_1",
                &format!("pre-key-{i}.json"),
                json!({"i": i}),
                BackupKind::Key(KeyKind::PreKey),
            );
        }

        // Each stalled record burns the full per-record timeout; paused time
        // auto-advances through them.
        wait_for(|| !queue.health().is_healthy()).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_pre_key_suppressed_while_unhealthy_in_file_mode() {
        let store = Arc::new(MemorySecondaryStore::new());
        let (queue, cancel) = queue_over(&store, true);

        // Force unhealthy directly.
        for _ in 0..UNHEALTHY_THRESHOLD {
            queue.health().record_timeout();
        }
        assert!(!queue.health().is_healthy());

        queue.enqueue_upsert(
            "session_1",
            "pre-key-1.json",
            json!({"k": 1}),
            BackupKind::Key(KeyKind::PreKey),
        );
        // Creds keep flowing even while unhealthy.
        queue.enqueue_upsert(
            "session_1",
            "creds.json",
            json!({"registered": true}),
            BackupKind::Creds,
        );

        wait_for(|| store.record("session_1", "creds.json").is_some()).await;
        assert!(store.record("session_1", "pre-key-1.json").is_none());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_success_resets_health() {
        let store = Arc::new(MemorySecondaryStore::new());
        let (queue, cancel) = queue_over(&store, false);

        for _ in 0..UNHEALTHY_THRESHOLD {
            queue.health().record_timeout();
        }
        assert!(!queue.health().is_healthy());

        queue.enqueue_upsert("session_1", "creds.json", json!({}), BackupKind::Creds);
        wait_for(|| queue.health().is_healthy()).await;
        cancel.cancel();
    }
}
