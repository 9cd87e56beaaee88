//! SQLite session metadata storage.
//!
//! Default adapter behind [`SessionStore`]. Uses connection pooling and WAL
//! mode; migrations run automatically on startup.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::session::{ConnectionStatus, SessionRecord, SessionSource};
use crate::store::{BotMode, SessionStore, StoreError, UserSettings};

/// SQLite-backed session store.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

/// Build the default store for a database URL.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if the connection fails and
/// [`StoreError::Migration`] if migrations fail.
pub async fn create_session_store(database_url: &str) -> Result<Box<dyn SessionStore>, StoreError> {
    Ok(Box::new(SqliteSessionStore::new(database_url).await?))
}

impl SqliteSessionStore {
    /// Create a store from a `sqlite:` URL, running migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if connection fails.
    /// Returns [`StoreError::Migration`] if migrations fail.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let url = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if url != ":memory:" {
            let path = PathBuf::from(url);
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Database(format!("failed to create database directory: {}", e))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(url)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord, StoreError> {
        let source_str: String = row.get("source");
        let source = SessionSource::parse(&source_str)
            .ok_or_else(|| StoreError::InvalidData(format!("unknown source: {source_str}")))?;

        let status_str: String = row.get("connection_status");
        let created_at = parse_datetime(&row.get::<String, _>("created_at"))?;
        let updated_at = parse_datetime(&row.get::<String, _>("updated_at"))?;
        let last_message_at = row
            .get::<Option<String>, _>("last_message_at")
            .map(|s| parse_datetime(&s))
            .transpose()?;

        Ok(SessionRecord {
            session_id: row.get("session_id"),
            user_id: row.get("user_id"),
            phone_number: row.get("phone_number"),
            source,
            connection_status: ConnectionStatus::parse(&status_str),
            reconnect_attempts: row.get::<i64, _>("reconnect_attempts") as u32,
            detected: row.get::<i64, _>("detected") != 0,
            voluntarily_disconnected: row.get::<i64, _>("voluntarily_disconnected") != 0,
            created_at,
            updated_at,
            last_message_at,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("invalid datetime: {e}")))
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, phone_number, source, connection_status,
                reconnect_attempts, detected, voluntarily_disconnected,
                created_at, updated_at, last_message_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (session_id) DO UPDATE SET
                phone_number = excluded.phone_number,
                source = excluded.source,
                connection_status = excluded.connection_status,
                reconnect_attempts = excluded.reconnect_attempts,
                detected = excluded.detected,
                voluntarily_disconnected = excluded.voluntarily_disconnected,
                updated_at = excluded.updated_at,
                last_message_at = excluded.last_message_at
            "#,
        )
        .bind(&record.session_id)
        .bind(&record.user_id)
        .bind(&record.phone_number)
        .bind(record.source.as_str())
        .bind(record.connection_status.as_str())
        .bind(i64::from(record.reconnect_attempts))
        .bind(i64::from(record.detected))
        .bind(i64::from(record.voluntarily_disconnected))
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.last_message_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        row.map(|r| Self::record_from_row(&r)).transpose()
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(Self::record_from_row).collect()
    }

    async fn set_connection_state(
        &self,
        session_id: &str,
        status: ConnectionStatus,
        reconnect_attempts: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET connection_status = ?, reconnect_attempts = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(i64::from(reconnect_attempts))
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn set_voluntarily_disconnected(
        &self,
        session_id: &str,
        voluntary: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET voluntarily_disconnected = ?, updated_at = ? WHERE session_id = ?",
        )
        .bind(i64::from(voluntary))
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn touch_last_message(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_message_at = ?, updated_at = ? WHERE session_id = ?")
            .bind(at.to_rfc3339())
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_user_settings(&self, user_id: &str) -> Result<UserSettings, StoreError> {
        let row = sqlx::query(
            "SELECT bot_mode, is_vip, group_only FROM user_settings WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        match row {
            Some(row) => Ok(UserSettings {
                bot_mode: BotMode::parse(&row.get::<String, _>("bot_mode")),
                is_vip: row.get::<i64, _>("is_vip") != 0,
                group_only: row.get::<i64, _>("group_only") != 0,
            }),
            None => Ok(UserSettings::default()),
        }
    }

    async fn set_user_settings(
        &self,
        user_id: &str,
        settings: &UserSettings,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (user_id, bot_mode, is_vip, group_only, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id) DO UPDATE SET
                bot_mode = excluded.bot_mode,
                is_vip = excluded.is_vip,
                group_only = excluded.group_only,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(settings.bot_mode.as_str())
        .bind(i64::from(settings.is_vip))
        .bind(i64::from(settings.group_only))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}
