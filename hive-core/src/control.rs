//! Control-bot notification port.
//!
//! The external chat-platform control bot lives outside this process; the
//! core only pushes one-shot lifecycle notifications through this trait.
//! The default implementation drops them.

use async_trait::async_trait;

/// A one-shot notification for the control surface.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A telegram-source session finished connecting.
    Connected {
        /// The session that connected.
        session_id: String,
        /// Its paired phone number.
        phone_number: String,
    },
    /// A session was permanently logged out.
    LoggedOut {
        /// The session that was logged out.
        session_id: String,
    },
}

/// Sink for control notifications.
#[async_trait]
pub trait ControlNotifier: Send + Sync {
    /// Deliver one notification. Failures must be swallowed by the
    /// implementation; the session lifecycle never depends on delivery.
    async fn notify(&self, event: ControlEvent);
}

/// Discards every notification.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl ControlNotifier for NoopNotifier {
    async fn notify(&self, _event: ControlEvent) {}
}

/// Records notifications for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: std::sync::Mutex<Vec<ControlEvent>>,
}

impl RecordingNotifier {
    /// Fresh recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything notified so far.
    pub fn events(&self) -> Vec<ControlEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlNotifier for RecordingNotifier {
    async fn notify(&self, event: ControlEvent) {
        self.events.lock().unwrap().push(event);
    }
}
