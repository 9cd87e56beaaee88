//! Secondary document-store tier for auth material.
//!
//! The secondary is a backup target only: writes are fire-and-forget through
//! the [`BackupQueue`](super::backup::BackupQueue), and reads happen solely
//! during initial sync when the local directory is empty. The bundled
//! adapter is MongoDB; tests use [`MemorySecondaryStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::TryStreamExt;
use mongodb::{
    Client,
    bson::{Document as BsonDocument, doc},
    options::ClientOptions,
};
use thiserror::Error;

/// Errors from the secondary tier. Never propagated into the hot path.
#[derive(Debug, Error)]
pub enum SecondaryError {
    /// Could not reach or authenticate to the store.
    #[error("secondary connection failed: {0}")]
    Connection(String),

    /// A single operation failed.
    #[error("secondary operation failed: {0}")]
    Operation(String),

    /// A stored payload could not be decoded.
    #[error("corrupt secondary record {session_id}/{file_name}: {reason}")]
    CorruptRecord {
        /// Owning session.
        session_id: String,
        /// Record file name.
        file_name: String,
        /// Decode failure detail.
        reason: String,
    },
}

/// Backup store keyed by `(session_id, file_name)`.
///
/// Payloads are the identical JSON documents written to the primary tier.
#[async_trait]
pub trait SecondaryStore: Send + Sync {
    /// Insert or replace one record.
    async fn upsert(
        &self,
        session_id: &str,
        file_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SecondaryError>;

    /// Delete one record. Deleting a missing record is not an error.
    async fn delete(&self, session_id: &str, file_name: &str) -> Result<(), SecondaryError>;

    /// Fetch one record.
    async fn get(
        &self,
        session_id: &str,
        file_name: &str,
    ) -> Result<Option<serde_json::Value>, SecondaryError>;

    /// List the file names stored for a session.
    async fn list_file_names(&self, session_id: &str) -> Result<Vec<String>, SecondaryError>;

    /// Drop every record belonging to a session.
    async fn delete_session(&self, session_id: &str) -> Result<(), SecondaryError>;

    /// Cheap liveness check used by the health probe.
    async fn ping(&self) -> Result<(), SecondaryError>;
}

/// MongoDB-backed secondary store.
///
/// One collection holds every record; the payload is stored as a JSON string
/// so key material with arbitrary field names survives BSON key rules.
pub struct MongoSecondaryStore {
    client: Client,
    db_name: String,
}

const COLLECTION: &str = "auth_records";

impl MongoSecondaryStore {
    /// Connect and verify reachability with a ping.
    ///
    /// # Errors
    ///
    /// Returns [`SecondaryError::Connection`] if the URI cannot be parsed,
    /// the client cannot be created, or the ping fails.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, SecondaryError> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|e| SecondaryError::Connection(format!("parse options: {e}")))?;

        let client = Client::with_options(options)
            .map_err(|e| SecondaryError::Connection(format!("create client: {e}")))?;

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| SecondaryError::Connection(format!("ping: {e}")))?;

        tracing::info!(db = db_name, "secondary auth store connected");

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    fn collection(&self) -> mongodb::Collection<BsonDocument> {
        self.client.database(&self.db_name).collection(COLLECTION)
    }
}

#[async_trait]
impl SecondaryStore for MongoSecondaryStore {
    async fn upsert(
        &self,
        session_id: &str,
        file_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SecondaryError> {
        let filter = doc! { "session_id": session_id, "file_name": file_name };
        let replacement = doc! {
            "session_id": session_id,
            "file_name": file_name,
            "payload": payload.to_string(),
            "updated_at": Utc::now().to_rfc3339(),
        };

        self.collection()
            .replace_one(filter, replacement)
            .upsert(true)
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, session_id: &str, file_name: &str) -> Result<(), SecondaryError> {
        self.collection()
            .delete_one(doc! { "session_id": session_id, "file_name": file_name })
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
        file_name: &str,
    ) -> Result<Option<serde_json::Value>, SecondaryError> {
        let found = self
            .collection()
            .find_one(doc! { "session_id": session_id, "file_name": file_name })
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?;

        match found {
            Some(document) => {
                let raw = document.get_str("payload").map_err(|e| {
                    SecondaryError::CorruptRecord {
                        session_id: session_id.to_string(),
                        file_name: file_name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let value = serde_json::from_str(raw).map_err(|e| {
                    SecondaryError::CorruptRecord {
                        session_id: session_id.to_string(),
                        file_name: file_name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn list_file_names(&self, session_id: &str) -> Result<Vec<String>, SecondaryError> {
        let mut cursor = self
            .collection()
            .find(doc! { "session_id": session_id })
            .projection(doc! { "file_name": 1 })
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?;

        let mut names = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?
        {
            if let Ok(name) = document.get_str("file_name") {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SecondaryError> {
        self.collection()
            .delete_many(doc! { "session_id": session_id })
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), SecondaryError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| SecondaryError::Operation(e.to_string()))?;
        Ok(())
    }
}

/// In-memory secondary store for tests.
///
/// Records land in a plain map. `stall` makes every operation hang long
/// enough to trip the backup queue's per-record timeout.
#[derive(Default)]
pub struct MemorySecondaryStore {
    records: std::sync::Mutex<HashMap<(String, String), serde_json::Value>>,
    stalled: std::sync::atomic::AtomicBool,
}

impl MemorySecondaryStore {
    /// Fresh empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation hang (simulates a dead secondary).
    pub fn stall(&self, stalled: bool) {
        self.stalled
            .store(stalled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Direct record lookup for assertions.
    pub fn record(&self, session_id: &str, file_name: &str) -> Option<serde_json::Value> {
        self.records
            .lock()
            .unwrap()
            .get(&(session_id.to_string(), file_name.to_string()))
            .cloned()
    }

    /// Seed a record, bypassing the async API.
    pub fn seed(&self, session_id: &str, file_name: &str, payload: serde_json::Value) {
        self.records
            .lock()
            .unwrap()
            .insert((session_id.to_string(), file_name.to_string()), payload);
    }

    async fn maybe_stall(&self) {
        if self.stalled.load(std::sync::atomic::Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
    }
}

#[async_trait]
impl SecondaryStore for MemorySecondaryStore {
    async fn upsert(
        &self,
        session_id: &str,
        file_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SecondaryError> {
        self.maybe_stall().await;
        self.seed(session_id, file_name, payload.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str, file_name: &str) -> Result<(), SecondaryError> {
        self.maybe_stall().await;
        self.records
            .lock()
            .unwrap()
            .remove(&(session_id.to_string(), file_name.to_string()));
        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
        file_name: &str,
    ) -> Result<Option<serde_json::Value>, SecondaryError> {
        self.maybe_stall().await;
        Ok(self.record(session_id, file_name))
    }

    async fn list_file_names(&self, session_id: &str) -> Result<Vec<String>, SecondaryError> {
        self.maybe_stall().await;
        Ok(self
            .records
            .lock()
            .unwrap()
            .keys()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SecondaryError> {
        self.maybe_stall().await;
        self.records
            .lock()
            .unwrap()
            .retain(|(sid, _), _| sid != session_id);
        Ok(())
    }

    async fn ping(&self) -> Result<(), SecondaryError> {
        self.maybe_stall().await;
        Ok(())
    }
}
