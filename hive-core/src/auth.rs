//! Dual-tier credential store.
//!
//! Auth material lives file-first under `<base>/<session_id>/`, one JSON
//! record per file, with binary fields encoded as
//! `{"type":"Buffer","data":"<base64>"}`. Every write lands locally and
//! synchronously; a secondary document store receives asynchronous,
//! fire-and-forget backups and is only read when the local directory is
//! empty (recovery after disk loss).
//!
//! Creds writes are validated and strictly serialized; pre-key bursts are
//! coalesced through a 50 ms per-file debounce window.

pub mod backup;
pub mod secondary;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::StorageMode;
use backup::{BackupHealth, BackupKind, BackupQueue};
use secondary::SecondaryStore;

/// Debounce window coalescing pre-key write bursts.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Concurrency for the initial secondary pull.
const INITIAL_SYNC_CONCURRENCY: usize = 90;

/// The creds record file name.
const CREDS_FILE: &str = "creds.json";

/// Errors from the auth store.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A creds write failed validation and was dropped.
    #[error("invalid creds write rejected")]
    InvalidCreds,

    /// The local file tier failed. Fatal: the caller must treat the
    /// session as corrupted.
    #[error("local auth storage error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// A record on disk could not be decoded.
    #[error("corrupt auth record '{file}': {reason}")]
    CorruptRecord {
        /// Record file name.
        file: String,
        /// Decode failure detail.
        reason: String,
    },
}

/// Typed key-record families stored alongside creds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// One-time pre-keys, written in bursts during pairing and rotation.
    PreKey,
    /// Signed pre-keys.
    SignedPreKey,
    /// Signal session state per peer.
    Session,
    /// App-state sync keys.
    AppStateSyncKey,
    /// Group sender keys.
    SenderKey,
}

impl KeyKind {
    /// File-name prefix for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::PreKey => "pre-key",
            KeyKind::SignedPreKey => "signed-pre-key",
            KeyKind::Session => "session",
            KeyKind::AppStateSyncKey => "app-state-sync-key",
            KeyKind::SenderKey => "sender-key",
        }
    }

    /// Record file name for one id of this kind.
    pub fn file_name(&self, id: &str) -> String {
        format!("{}-{}.json", self.as_str(), sanitize_id(id))
    }
}

/// Batched key-material mutation: `Some` upserts, `None` deletes.
pub type KeyUpdates = HashMap<KeyKind, HashMap<String, Option<Value>>>;

/// Record ids may carry jid separators; keep file names flat.
fn sanitize_id(id: &str) -> String {
    id.replace(['/', '\\', ':'], "_")
}

/// Encode raw bytes the way the wire format stores them.
pub fn encode_buffer(bytes: &[u8]) -> Value {
    serde_json::json!({ "type": "Buffer", "data": BASE64.encode(bytes) })
}

/// Decode a `{"type":"Buffer","data":...}` value back to raw bytes.
pub fn decode_buffer(value: &Value) -> Option<Vec<u8>> {
    if value.get("type").and_then(Value::as_str) != Some("Buffer") {
        return None;
    }
    let data = value.get("data").and_then(Value::as_str)?;
    BASE64.decode(data).ok()
}

/// A creds record is writable only when the identity material is complete
/// and the device is registered. Pairing-in-progress is the one exemption,
/// handled by the caller.
pub fn validate_creds(creds: &Value) -> bool {
    let present = |key: &str| creds.get(key).is_some_and(|v| !v.is_null());
    present("noiseKey")
        && present("signedIdentityKey")
        && present("me")
        && present("account")
        && creds.get("registered").and_then(Value::as_bool) == Some(true)
}

/// The dual-tier auth store. One per process; hands out per-session
/// [`AuthHandle`]s.
pub struct AuthStore {
    base_dir: PathBuf,
    secondary: Option<Arc<dyn SecondaryStore>>,
    backup: Option<BackupQueue>,
}

impl AuthStore {
    /// Create the store. When a secondary is given, the backup worker and
    /// health probe start immediately under `cancel`.
    pub fn new(
        base_dir: impl Into<PathBuf>,
        mode: StorageMode,
        secondary: Option<Arc<dyn SecondaryStore>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let backup = secondary.as_ref().map(|s| {
            BackupQueue::start(
                Arc::clone(s),
                mode == StorageMode::File,
                cancel.child_token(),
            )
        });
        Arc::new(Self {
            base_dir: base_dir.into(),
            secondary,
            backup,
        })
    }

    /// Secondary health, when a secondary tier is configured.
    pub fn backup_health(&self) -> Option<&Arc<BackupHealth>> {
        self.backup.as_ref().map(BackupQueue::health)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(session_id)
    }

    /// Open (or create) a session's auth material.
    ///
    /// Loads creds from disk when present; otherwise starts from a fresh
    /// unregistered record. When the local directory holds no records and a
    /// secondary is configured, the secondary is pulled first.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LocalIo`] when the directory cannot be created
    /// or read.
    pub async fn open(&self, session_id: &str) -> Result<AuthHandle, AuthError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir).await?;

        if self.local_record_count(&dir).await? == 0
            && let Some(secondary) = &self.secondary
        {
            self.initial_sync(session_id, &dir, secondary.as_ref()).await;
        }

        let creds = match read_record(&dir.join(CREDS_FILE)).await? {
            Some(creds) => creds,
            None => serde_json::json!({ "registered": false }),
        };

        Ok(AuthHandle {
            inner: Arc::new(HandleInner {
                session_id: session_id.to_string(),
                dir,
                backup: self.backup.clone(),
                creds: StdMutex::new(creds),
                creds_write: Mutex::new(()),
                pairing: AtomicBool::new(false),
                pending: StdMutex::new(HashMap::new()),
            }),
        })
    }

    /// Whether the session has complete, registered creds on disk.
    pub async fn has_valid(&self, session_id: &str) -> bool {
        let path = self.session_dir(session_id).join(CREDS_FILE);
        match read_record(&path).await {
            Ok(Some(creds)) => validate_creds(&creds),
            _ => false,
        }
    }

    /// Remove every trace of a session: the local directory now, the
    /// secondary records best-effort in the background.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LocalIo`] if the local directory exists but
    /// cannot be removed.
    pub async fn cleanup(&self, session_id: &str) -> Result<(), AuthError> {
        let dir = self.session_dir(session_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(secondary) = &self.secondary {
            let secondary = Arc::clone(secondary);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = secondary.delete_session(&session_id).await {
                    tracing::warn!(session_id, error = %e, "secondary cleanup failed");
                }
            });
        }
        Ok(())
    }

    async fn local_record_count(&self, dir: &Path) -> Result<usize, AuthError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Pull every record for the session from the secondary in parallel.
    /// Failures leave the session starting fresh; they are logged, not
    /// propagated.
    async fn initial_sync(&self, session_id: &str, dir: &Path, secondary: &dyn SecondaryStore) {
        let names = match secondary.list_file_names(session_id).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "initial sync listing failed");
                return;
            }
        };
        if names.is_empty() {
            return;
        }

        tracing::info!(session_id, records = names.len(), "restoring auth material from secondary");

        let restored = futures::stream::iter(names)
            .map(|name| async move {
                match secondary.get(session_id, &name).await {
                    Ok(Some(payload)) => {
                        let path = dir.join(&name);
                        match write_atomic(&path, &payload).await {
                            Ok(()) => 1usize,
                            Err(e) => {
                                tracing::warn!(session_id, file = name, error = %e, "restore write failed");
                                0
                            }
                        }
                    }
                    Ok(None) => 0,
                    Err(e) => {
                        tracing::warn!(session_id, file = name, error = %e, "restore read failed");
                        0
                    }
                }
            })
            .buffer_unordered(INITIAL_SYNC_CONCURRENCY)
            .fold(0usize, |acc, n| async move { acc + n })
            .await;

        tracing::info!(session_id, restored, "initial sync complete");
    }
}

/// A pre-key write waiting out its debounce window.
struct PendingWrite {
    value: Value,
}

struct HandleInner {
    session_id: String,
    dir: PathBuf,
    backup: Option<BackupQueue>,
    creds: StdMutex<Value>,
    /// Serializes `save_creds`: at most one in-flight creds write.
    creds_write: Mutex<()>,
    pairing: AtomicBool,
    /// Debounced pre-key writes keyed by file name; one timer per key.
    pending: StdMutex<HashMap<String, PendingWrite>>,
}

/// Per-session view onto the auth store. Cheap to clone; all clones share
/// state.
#[derive(Clone)]
pub struct AuthHandle {
    inner: Arc<HandleInner>,
}

impl AuthHandle {
    /// The owning session id.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Snapshot of the current creds record.
    pub fn creds(&self) -> Value {
        self.inner.creds.lock().unwrap().clone()
    }

    /// Whether the device is paired and registered.
    pub fn is_registered(&self) -> bool {
        self.creds().get("registered").and_then(Value::as_bool) == Some(true)
    }

    /// Toggle the pairing exemption for creds validation.
    pub fn mark_pairing(&self, in_progress: bool) {
        self.inner.pairing.store(in_progress, Ordering::SeqCst);
    }

    /// Whether pairing is currently in progress.
    pub fn pairing_in_progress(&self) -> bool {
        self.inner.pairing.load(Ordering::SeqCst)
    }

    /// Read key material, in parallel, by kind and id. Missing or corrupt
    /// records are absent from the result.
    pub async fn get(&self, kind: KeyKind, ids: &[String]) -> HashMap<String, Value> {
        let reads = ids.iter().map(|id| {
            let file_name = kind.file_name(id);
            let inner = Arc::clone(&self.inner);
            async move {
                // A value still inside its debounce window wins over disk.
                let pending = inner
                    .pending
                    .lock()
                    .unwrap()
                    .get(&file_name)
                    .map(|p| p.value.clone());
                if let Some(value) = pending {
                    return Some((file_name, value));
                }
                match read_record(&inner.dir.join(&file_name)).await {
                    Ok(Some(value)) => Some((file_name, value)),
                    Ok(None) => None,
                    Err(e) => {
                        tracing::warn!(file = file_name, error = %e, "unreadable key record");
                        None
                    }
                }
            }
        });

        let mut out = HashMap::new();
        for (file_name, value) in futures::future::join_all(reads).await.into_iter().flatten() {
            // Map back from file name to the caller's id.
            if let Some(id) = ids.iter().find(|id| kind.file_name(id) == file_name) {
                out.insert(id.clone(), value);
            }
        }
        out
    }

    /// Apply a batch of key upserts and deletes.
    ///
    /// Pre-key upserts are debounced per file for [`DEBOUNCE_WINDOW`];
    /// everything else lands immediately. Every mutation enqueues a backup.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LocalIo`] on a failed immediate write or delete.
    pub async fn set(&self, updates: KeyUpdates) -> Result<(), AuthError> {
        for (kind, records) in updates {
            for (id, maybe_value) in records {
                let file_name = kind.file_name(&id);
                match maybe_value {
                    Some(value) => {
                        if kind == KeyKind::PreKey {
                            self.debounce_write(file_name, value, kind);
                        } else {
                            self.inner.write_record(&file_name, &value, BackupKind::Key(kind)).await?;
                        }
                    }
                    None => {
                        self.inner.pending.lock().unwrap().remove(&file_name);
                        self.inner.delete_record(&file_name, BackupKind::Key(kind)).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist the creds record.
    ///
    /// Validated unless pairing is in progress; a rejected write is dropped
    /// with [`AuthError::InvalidCreds`]. Writes are strictly serialized.
    pub async fn save_creds(&self, creds: &Value) -> Result<(), AuthError> {
        let _serial = self.inner.creds_write.lock().await;

        if !self.pairing_in_progress() && !validate_creds(creds) {
            tracing::warn!(
                session_id = self.inner.session_id,
                "dropping invalid creds write"
            );
            return Err(AuthError::InvalidCreds);
        }

        self.inner
            .write_record(CREDS_FILE, creds, BackupKind::Creds)
            .await?;
        *self.inner.creds.lock().unwrap() = creds.clone();
        Ok(())
    }

    /// Flush pending debounced writes and stop their timers.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::LocalIo`] if a final flush fails.
    pub async fn close(&self) -> Result<(), AuthError> {
        let drained: Vec<(String, Value)> = {
            let mut pending = self.inner.pending.lock().unwrap();
            pending.drain().map(|(k, p)| (k, p.value)).collect()
        };
        for (file_name, value) in drained {
            self.inner
                .write_record(&file_name, &value, BackupKind::Key(KeyKind::PreKey))
                .await?;
        }
        Ok(())
    }

    /// Schedule (or refresh the value of) a debounced pre-key write. The
    /// timer is per file name; later writes inside the window replace the
    /// value without rescheduling.
    fn debounce_write(&self, file_name: String, value: Value, kind: KeyKind) {
        let mut pending = self.inner.pending.lock().unwrap();
        if let Some(existing) = pending.get_mut(&file_name) {
            existing.value = value;
            return;
        }
        pending.insert(file_name.clone(), PendingWrite { value });
        drop(pending);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE_WINDOW).await;
            let taken = inner.pending.lock().unwrap().remove(&file_name);
            if let Some(write) = taken
                && let Err(e) = inner
                    .write_record(&file_name, &write.value, BackupKind::Key(kind))
                    .await
            {
                tracing::error!(
                    session_id = inner.session_id,
                    file = file_name,
                    error = %e,
                    "debounced key write failed"
                );
            }
        });
    }
}

impl HandleInner {
    async fn write_record(
        &self,
        file_name: &str,
        value: &Value,
        kind: BackupKind,
    ) -> Result<(), AuthError> {
        write_atomic(&self.dir.join(file_name), value).await?;
        if let Some(backup) = &self.backup {
            backup.enqueue_upsert(&self.session_id, file_name, value.clone(), kind);
        }
        Ok(())
    }

    async fn delete_record(&self, file_name: &str, kind: BackupKind) -> Result<(), AuthError> {
        match tokio::fs::remove_file(self.dir.join(file_name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(backup) = &self.backup {
            backup.enqueue_delete(&self.session_id, file_name, kind);
        }
        Ok(())
    }
}

/// Read and decode one JSON record; `None` when the file does not exist.
async fn read_record(path: &Path) -> Result<Option<Value>, AuthError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| AuthError::CorruptRecord {
            file: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            reason: e.to_string(),
        })
}

/// Write-then-rename so no record is ever observable half-written.
async fn write_atomic(path: &Path, value: &Value) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    let bytes = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
