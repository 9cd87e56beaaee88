//! Session metadata persistence.
//!
//! Provides the [`SessionStore`] trait as a port for storage implementations,
//! along with error types and the SQLite adapter. Holds the session registry
//! rows that survive restarts plus the per-user bot settings the dispatcher
//! gates consult.

pub mod sqlite;

pub use sqlite::{SqliteSessionStore, create_session_store};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::session::{ConnectionStatus, SessionRecord};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// The requested session row was not found.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A migration operation failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// Invalid data was encountered.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// How the bot reacts to non-creator messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BotMode {
    /// Commands from anyone pass the gates.
    #[default]
    Public,
    /// Only the creator's messages are processed.
    SelfOnly,
}

impl BotMode {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BotMode::Public => "public",
            BotMode::SelfOnly => "self",
        }
    }

    /// Parse the storage representation. Unknown values read as public.
    pub fn parse(s: &str) -> Self {
        match s {
            "self" => BotMode::SelfOnly,
            _ => BotMode::Public,
        }
    }
}

/// Per-user dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSettings {
    /// Bot mode gate input.
    pub bot_mode: BotMode,
    /// Whether the mapped account is VIP.
    pub is_vip: bool,
    /// Whether group commands are enabled for this user's sessions.
    pub group_only: bool,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            bot_mode: BotMode::Public,
            is_vip: false,
            group_only: true,
        }
    }
}

/// Port for session metadata storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError>;

    /// Get a session row by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// List every session row, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Persist a connection-state transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the row does not exist.
    async fn set_connection_state(
        &self,
        session_id: &str,
        status: ConnectionStatus,
        reconnect_attempts: u32,
    ) -> Result<(), StoreError>;

    /// Persist the voluntary-disconnect flag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the row does not exist.
    async fn set_voluntarily_disconnected(
        &self,
        session_id: &str,
        voluntary: bool,
    ) -> Result<(), StoreError>;

    /// Stamp message activity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    async fn touch_last_message(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Delete a session row.
    ///
    /// Returns `Ok(true)` if a row was deleted, `Ok(false)` if not found.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError>;

    /// Per-user settings, defaults when the user has no row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    async fn get_user_settings(&self, user_id: &str) -> Result<UserSettings, StoreError>;

    /// Insert or replace per-user settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    async fn set_user_settings(
        &self,
        user_id: &str,
        settings: &UserSettings,
    ) -> Result<(), StoreError>;
}
