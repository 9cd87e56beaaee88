//! The SocketDriver contract.
//!
//! The encrypted WhatsApp transport is an external collaborator; the core
//! only sees this trait. Implementations own the wire protocol, the noise
//! session, and event buffering. The bundled [`MockDriver`](mock::MockDriver)
//! is a scripted in-memory implementation used by tests and the `mock`
//! driver kind.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by a SocketDriver, tagged by consequence.
///
/// Callers branch on these variants instead of string-matching; the retry
/// and fallback policies in the send wrapper and GroupCache depend on the
/// classification helpers below.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// The server rejected the operation because of rate limiting.
    #[error("rate limited by server")]
    RateLimited,

    /// The bot is not allowed to perform the operation (e.g. not in the group).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The session lacks authorization for the operation.
    #[error("not authorized")]
    NotAuthorized,

    /// The target jid could not be parsed or addressed.
    #[error("invalid jid: {0}")]
    InvalidJid(String),

    /// The recipient does not exist on the network.
    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    /// The operation did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The socket is closed.
    #[error("socket closed (code {})", .0.code)]
    Closed(DisconnectReason),

    /// Anything the driver could not classify.
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Whether a failed send may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout | DriverError::Transport(_) | DriverError::Other(_)
        )
    }

    /// Whether retrying is pointless regardless of backoff.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DriverError::Forbidden(_)
                | DriverError::NotAuthorized
                | DriverError::InvalidJid(_)
                | DriverError::RecipientNotFound(_)
                | DriverError::RateLimited
        )
    }
}

/// Post-connect identity of the paired device.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverUser {
    /// Full device jid, e.g. `15551234567:3@s.whatsapp.net`.
    pub id: String,
}

impl DriverUser {
    /// The bare phone number of the paired device.
    pub fn phone_number(&self) -> &str {
        jid_phone(&self.id)
    }
}

/// Transport-level socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    /// No socket.
    #[default]
    Closed,
    /// TCP/WebSocket handshake in progress.
    Connecting,
    /// Transport established.
    Open,
}

/// Connection lifecycle phase announced via `ConnectionUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport connecting.
    Connecting,
    /// Authenticated and usable.
    Open,
    /// Torn down; the reason carries the status code.
    Close,
}

/// Why a connection closed. Codes follow the upstream status-code space.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectReason {
    /// Status code, e.g. 401 logged out, 440 replaced, 515 stream restart.
    pub code: u16,
    /// Human-readable detail from the transport.
    pub message: String,
}

impl DisconnectReason {
    /// Convenience constructor.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Identifies one message within one chat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    /// Chat jid the message belongs to.
    pub chat_id: String,
    /// Server-assigned message id.
    pub id: String,
    /// Whether this device sent the message.
    pub from_me: bool,
    /// Group sender jid, for group chats.
    pub participant: Option<String>,
}

/// A decrypted inbound message as delivered by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Message identity.
    pub key: MessageKey,
    /// Extracted text content, when the message carries any.
    pub text: Option<String>,
    /// Mentioned jids.
    pub mentions: Vec<String>,
    /// Sender display name.
    pub push_name: Option<String>,
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    /// The jid of whoever sent the message (participant in groups, chat peer otherwise).
    pub fn sender_id(&self) -> &str {
        self.key.participant.as_deref().unwrap_or(&self.key.chat_id)
    }
}

/// Whether an upsert is live traffic or history backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    /// Live message, should enter dispatch.
    Notify,
    /// History/offline append, indexed but not dispatched.
    Append,
}

/// Group admin tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRole {
    /// Regular admin.
    Admin,
    /// Group creator.
    SuperAdmin,
}

/// One group member.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Canonical participant identifier as the driver reported it.
    pub id: String,
    /// Chat-addressable jid, when known.
    pub jid: Option<String>,
    /// Phone-addressable id, when known.
    pub phone_number: Option<String>,
    /// Admin tier, `None` for plain members.
    pub admin: Option<AdminRole>,
}

/// Group metadata as fetched from the driver or served from cache.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMetadata {
    /// Group jid.
    pub id: String,
    /// Display subject.
    pub subject: String,
    /// Current members.
    pub participants: Vec<Participant>,
    /// Only admins may send.
    pub announce: bool,
    /// Only admins may edit group info.
    pub restrict: bool,
}

/// A partial group change delivered via `groups.update`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupUpdate {
    /// Group jid.
    pub id: String,
    /// New subject, if changed.
    pub subject: Option<String>,
    /// New announce flag, if changed.
    pub announce: Option<bool>,
    /// New restrict flag, if changed.
    pub restrict: Option<bool>,
}

/// Membership change kind for `group-participants.update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantAction {
    /// Members joined or were added.
    Add,
    /// Members left or were removed.
    Remove,
    /// Members were promoted to admin.
    Promote,
    /// Members were demoted.
    Demote,
}

/// A contact push-name change.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactUpdate {
    /// Contact jid.
    pub id: String,
    /// New display name.
    pub notify: Option<String>,
}

/// Registration check result for one number.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberCheck {
    /// Resolved jid.
    pub jid: String,
    /// Whether the number is registered.
    pub exists: bool,
}

/// Newsletter channel metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NewsletterMetadata {
    /// Newsletter jid.
    pub id: String,
    /// Channel name.
    pub name: String,
    /// Whether this session follows the channel.
    pub following: bool,
}

/// Outbound message payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageContent {
    /// Text body.
    pub text: String,
    /// Jids to mention. Mentioning triggers a group-metadata fetch in the
    /// driver, which multiplies rate budget.
    pub mentions: Vec<String>,
}

impl MessageContent {
    /// Plain text payload.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            text: body.into(),
            mentions: Vec::new(),
        }
    }

    /// Text payload with mentions.
    pub fn with_mentions(body: impl Into<String>, mentions: Vec<String>) -> Self {
        Self {
            text: body.into(),
            mentions,
        }
    }

    /// The same payload with mentions removed.
    pub fn without_mentions(&self) -> Self {
        Self {
            text: self.text.clone(),
            mentions: Vec::new(),
        }
    }
}

/// Per-send options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SendOptions {
    /// Disappearing-message timer in seconds. `None` lets the wrapper
    /// default it to 0.
    pub ephemeral_expiration: Option<u32>,
    /// Message being replied to.
    pub quoted: Option<MessageKey>,
}

/// Acknowledgement for a sent message.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Identity the server assigned.
    pub key: MessageKey,
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Everything a driver can announce, in emission order per session.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Connection lifecycle change.
    ConnectionUpdate {
        /// New phase.
        state: ConnectionState,
        /// Close reason, present for `Close`.
        reason: Option<DisconnectReason>,
    },
    /// Credential material changed; the owner must persist the snapshot.
    CredsUpdate {
        /// Full serialized creds record.
        creds: serde_json::Value,
    },
    /// New messages arrived or were backfilled.
    MessagesUpsert {
        /// The messages, in order.
        messages: Vec<InboundMessage>,
        /// Live or backfill.
        kind: UpsertKind,
    },
    /// Existing messages changed (edits, receipts).
    MessagesUpdate {
        /// Affected keys.
        keys: Vec<MessageKey>,
    },
    /// Group metadata changed.
    GroupsUpdate {
        /// Partial updates.
        updates: Vec<GroupUpdate>,
    },
    /// Group membership changed.
    GroupParticipantsUpdate {
        /// Group jid.
        group_id: String,
        /// What happened.
        action: ParticipantAction,
        /// Affected member jids.
        participants: Vec<String>,
    },
    /// Contact push-names changed.
    ContactsUpdate {
        /// Affected contacts.
        contacts: Vec<ContactUpdate>,
    },
    /// Incoming call offer.
    Call {
        /// Caller jid.
        from: String,
        /// Call id.
        id: String,
    },
    /// LID-to-phone mapping learned.
    LidMappingUpdate {
        /// The lid jid.
        lid: String,
        /// The phone jid it maps to.
        phone_jid: String,
    },
}

/// Callback the driver uses to re-fetch a message during decryption retry.
///
/// Arguments are `(chat_id, message_id)`; a `None` return makes the driver
/// fall back to a formal retry receipt.
pub type MessageLookup = Arc<dyn Fn(&str, &str) -> Option<InboundMessage> + Send + Sync>;

/// The opaque WhatsApp client the core drives.
///
/// One instance per session; instances coexist with independent event
/// streams. Event delivery within one instance is sequential.
#[async_trait]
pub trait SocketDriver: Send + Sync {
    /// Post-connect identity, `None` until authenticated.
    fn user(&self) -> Option<DriverUser>;

    /// Current transport state.
    fn transport_state(&self) -> TransportState;

    /// Subscribe to the event stream. Each receiver observes events in
    /// emission order.
    fn subscribe(&self) -> broadcast::Receiver<DriverEvent>;

    /// Install the decryption-retry message lookup.
    fn set_message_lookup(&self, lookup: MessageLookup);

    /// Start the transport.
    async fn connect(&self) -> Result<(), DriverError>;

    /// Send a message. The core always goes through the outbound wrapper
    /// instead of calling this directly.
    async fn send_message(
        &self,
        jid: &str,
        content: MessageContent,
        options: SendOptions,
    ) -> Result<SentMessage, DriverError>;

    /// Fetch group metadata.
    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, DriverError>;

    /// Check whether phone numbers are registered.
    async fn on_whatsapp(&self, phone: &str) -> Result<Vec<NumberCheck>, DriverError>;

    /// Request a pairing code for a phone number.
    async fn request_pairing_code(&self, phone: &str) -> Result<String, DriverError>;

    /// Follow a newsletter channel.
    async fn newsletter_follow(&self, jid: &str) -> Result<(), DriverError>;

    /// Unmute a followed newsletter.
    async fn newsletter_unmute(&self, jid: &str) -> Result<(), DriverError>;

    /// Subscribe to live newsletter updates.
    async fn subscribe_newsletter_updates(&self, jid: &str) -> Result<(), DriverError>;

    /// Fetch newsletter metadata.
    async fn newsletter_metadata(&self, jid: &str) -> Result<NewsletterMetadata, DriverError>;

    /// Pin or unpin a chat.
    async fn chat_modify_pin(&self, jid: &str, pinned: bool) -> Result<(), DriverError>;

    /// Record a LID-to-phone mapping. Drivers without LID support may no-op.
    async fn store_lid_mapping(&self, _lid: &str, _phone_jid: &str) -> Result<(), DriverError> {
        Ok(())
    }

    /// Release events buffered during initial sync. Called once the
    /// MessageStore has had time to index the backlog.
    async fn flush_buffered_events(&self);

    /// Log the device out, invalidating the pairing.
    async fn logout(&self) -> Result<(), DriverError>;

    /// Tear down the transport without logging out.
    async fn close(&self);
}

/// Builds driver instances for the ConnectionManager.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Create a driver bound to a session's auth material.
    async fn create(
        &self,
        session_id: &str,
        auth: crate::auth::AuthHandle,
    ) -> Result<Arc<dyn SocketDriver>, DriverError>;
}

/// Extract the bare phone number from a jid: strips the device suffix and
/// the server part. Returns the input unchanged when it is not jid-shaped.
pub fn jid_phone(jid: &str) -> &str {
    let local = jid.split('@').next().unwrap_or(jid);
    local.split(':').next().unwrap_or(local)
}

/// Whether a jid addresses a group chat.
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}

/// Canonical user jid for a bare phone number.
pub fn phone_to_jid(phone: &str) -> String {
    format!("{}@s.whatsapp.net", jid_phone(phone))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_phone_strips_device_and_server() {
        assert_eq!(jid_phone("15551234567:3@s.whatsapp.net"), "15551234567");
        assert_eq!(jid_phone("15551234567@s.whatsapp.net"), "15551234567");
        assert_eq!(jid_phone("15551234567"), "15551234567");
    }

    #[test]
    fn test_is_group_jid() {
        assert!(is_group_jid("1203630000-1632@g.us"));
        assert!(!is_group_jid("15551234567@s.whatsapp.net"));
        assert!(!is_group_jid("123@newsletter"));
    }

    #[test]
    fn test_phone_to_jid() {
        assert_eq!(phone_to_jid("15551234567"), "15551234567@s.whatsapp.net");
        // Already-jid input collapses to the canonical user form.
        assert_eq!(
            phone_to_jid("15551234567:9@s.whatsapp.net"),
            "15551234567@s.whatsapp.net"
        );
    }

    #[test]
    fn test_sender_id_prefers_participant() {
        let msg = InboundMessage {
            key: MessageKey {
                chat_id: "g@g.us".to_string(),
                id: "A1".to_string(),
                from_me: false,
                participant: Some("u@s.whatsapp.net".to_string()),
            },
            text: None,
            mentions: Vec::new(),
            push_name: None,
            timestamp: Utc::now(),
        };
        assert_eq!(msg.sender_id(), "u@s.whatsapp.net");

        let dm = InboundMessage {
            key: MessageKey {
                chat_id: "u@s.whatsapp.net".to_string(),
                id: "A2".to_string(),
                from_me: false,
                participant: None,
            },
            ..msg
        };
        assert_eq!(dm.sender_id(), "u@s.whatsapp.net");
    }

    #[test]
    fn test_error_classification() {
        assert!(DriverError::Timeout.is_transient());
        assert!(DriverError::Transport("reset".into()).is_transient());
        assert!(!DriverError::RateLimited.is_transient());
        assert!(DriverError::RateLimited.is_permanent());
        assert!(DriverError::Forbidden("not in group".into()).is_permanent());
        assert!(DriverError::InvalidJid("x".into()).is_permanent());
        assert!(DriverError::RecipientNotFound("y".into()).is_permanent());
        assert!(!DriverError::Timeout.is_permanent());
    }

    #[test]
    fn test_without_mentions_preserves_text() {
        let content = MessageContent::with_mentions("hi @a", vec!["a@s.whatsapp.net".into()]);
        let stripped = content.without_mentions();
        assert_eq!(stripped.text, "hi @a");
        assert!(stripped.mentions.is_empty());
    }
}
