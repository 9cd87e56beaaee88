//! Hot-reload watcher for plugin descriptors.
//!
//! Watches the descriptor tree recursively, debounces bursts per path, and
//! hands changed paths to [`PluginHost::reload_path`]. Runs as a background
//! task until cancelled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{PluginError, PluginHost};

/// Hot-reload daemon handle.
pub struct PluginWatcher {
    host: Arc<PluginHost>,
    debounce: Duration,
    watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    root: PathBuf,
}

impl PluginWatcher {
    /// Create a watcher over one descriptor root.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Failed`] if the filesystem watcher cannot be
    /// initialized.
    pub fn new(
        host: Arc<PluginHost>,
        root: impl Into<PathBuf>,
        debounce: Duration,
    ) -> Result<Self, PluginError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| PluginError::Failed(format!("filesystem watcher: {e}")))?;

        Ok(Self {
            host,
            debounce,
            watcher,
            raw_rx,
            root: root.into(),
        })
    }

    /// Start watching and spawn the reload loop.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Failed`] if the root cannot be watched.
    pub fn spawn(mut self, cancel: CancellationToken) -> Result<(), PluginError> {
        self.watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| PluginError::Failed(format!("watch {}: {e}", self.root.display())))?;
        tracing::info!(root = %self.root.display(), "watching plugin descriptors");

        tokio::spawn(self.run(cancel));
        Ok(())
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

        loop {
            let next_deadline = pending.values().copied().min();

            tokio::select! {
                biased;

                () = cancel.cancelled() => return,

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(path, _)| path.clone())
                        .collect();

                    for path in ready {
                        pending.remove(&path);
                        match self.host.reload_path(&path) {
                            Ok(()) => {
                                tracing::info!(path = %path.display(), "plugin descriptor reloaded");
                            }
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "descriptor reload failed");
                            }
                        }
                    }
                }

                event = self.raw_rx.recv() => {
                    match event {
                        Some(Ok(ev)) => handle_raw_event(&ev, &mut pending, self.debounce),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "plugin watcher error");
                        }
                        None => {
                            tracing::debug!("plugin watcher channel closed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Reset the debounce timer for every descriptor touched by one raw event.
fn handle_raw_event(
    event: &Event,
    pending: &mut HashMap<PathBuf, tokio::time::Instant>,
    debounce: Duration,
) {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
        _ => return,
    }

    for path in &event.paths {
        if !is_descriptor(path) {
            continue;
        }
        tracing::debug!(path = %path.display(), kind = ?event.kind, "descriptor change detected");
        pending.insert(path.clone(), tokio::time::Instant::now() + debounce);
    }
}

fn is_descriptor(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("toml")
}
