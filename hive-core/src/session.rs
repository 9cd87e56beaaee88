//! Session record types.
//!
//! A [`SessionRecord`] describes one hosted WhatsApp client: who owns it,
//! which surface created it, and where its connection currently stands.

use chrono::{DateTime, Utc};

/// Where a session was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionSource {
    /// Created through the external chat-platform control bot.
    Telegram,
    /// Created through the web admin surface.
    Web,
}

impl SessionSource {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Telegram => "telegram",
            SessionSource::Web => "web",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(SessionSource::Telegram),
            "web" => Some(SessionSource::Web),
            _ => None,
        }
    }
}

/// Connection state of a hosted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// No live socket.
    #[default]
    Disconnected,
    /// Socket created, transport handshake in progress.
    Connecting,
    /// Transport open and authenticated.
    Connected,
}

impl ConnectionStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }

    /// Parse the storage representation. Unknown values read as disconnected.
    pub fn parse(s: &str) -> Self {
        match s {
            "connecting" => ConnectionStatus::Connecting,
            "connected" => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// One hosted WhatsApp session, keyed by `session_<user_id>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    /// Unique identifier, always `session_<user_id>`.
    pub session_id: String,
    /// External chat-platform id of the owning user.
    pub user_id: String,
    /// Phone number the session pairs as.
    pub phone_number: String,
    /// Surface that created the session.
    pub source: SessionSource,
    /// Current connection state.
    pub connection_status: ConnectionStatus,
    /// Consecutive reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Whether the paired device has been observed on the network.
    pub detected: bool,
    /// Set when the user asked for the disconnect; suppresses reconnects.
    pub voluntarily_disconnected: bool,
    /// When the session row was created.
    pub created_at: DateTime<Utc>,
    /// When the session row last changed.
    pub updated_at: DateTime<Utc>,
    /// Last observed inbound or outbound message activity.
    pub last_message_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Create a fresh, disconnected session record for a user.
    pub fn new(user_id: impl Into<String>, phone_number: impl Into<String>, source: SessionSource) -> Self {
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            session_id: session_id_for(&user_id),
            user_id,
            phone_number: phone_number.into(),
            source,
            connection_status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            detected: false,
            voluntarily_disconnected: false,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        }
    }
}

/// Canonical session id for a user.
pub fn session_id_for(user_id: &str) -> String {
    format!("session_{user_id}")
}

/// Extract the user id from a canonical session id, if it is one.
pub fn user_id_from_session(session_id: &str) -> Option<&str> {
    session_id.strip_prefix("session_")
}
