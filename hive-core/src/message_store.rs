//! Per-session in-memory message index.
//!
//! Keeps recently observed messages so the driver can re-fetch them during
//! decryption retries. Not authoritative: a miss returns `None` and the
//! driver falls back to a formal retry receipt. Bounded by insertion-order
//! eviction when the high-water mark is crossed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::driver::{DriverEvent, InboundMessage, MessageLookup};

/// Entry count that triggers eviction.
const HIGH_WATER: usize = 2_000;

/// Entry count eviction trims down to.
const LOW_WATER: usize = 1_500;

struct StoreInner {
    by_key: HashMap<(String, String), InboundMessage>,
    insertion_order: VecDeque<(String, String)>,
}

/// Bounded message index for one session.
pub struct MessageStore {
    inner: Mutex<StoreInner>,
}

impl MessageStore {
    /// Empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                by_key: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        })
    }

    /// Index one message. Re-upserts of a known key replace the payload
    /// without disturbing eviction order.
    pub fn insert(&self, message: InboundMessage) {
        let key = (message.key.chat_id.clone(), message.key.id.clone());
        let mut inner = self.inner.lock().unwrap();
        if inner.by_key.insert(key.clone(), message).is_none() {
            inner.insertion_order.push_back(key);
        }
        if inner.by_key.len() > HIGH_WATER {
            while inner.by_key.len() > LOW_WATER {
                match inner.insertion_order.pop_front() {
                    Some(oldest) => {
                        inner.by_key.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
    }

    /// Look up a message for decryption retry.
    pub fn load_message(&self, chat_id: &str, message_id: &str) -> Option<InboundMessage> {
        self.inner
            .lock()
            .unwrap()
            .by_key
            .get(&(chat_id.to_string(), message_id.to_string()))
            .cloned()
    }

    /// Drop everything. Used when a session goes inactive and its auxiliary
    /// state is reclaimed.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_key.clear();
        inner.insertion_order.clear();
    }

    /// Number of indexed messages.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_key.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed one driver event through the index. Only `messages.upsert`
    /// matters; everything else passes through untouched.
    pub fn observe(&self, event: &DriverEvent) {
        if let DriverEvent::MessagesUpsert { messages, .. } = event {
            for message in messages {
                self.insert(message.clone());
            }
        }
    }

    /// The lookup callback handed to the driver as its `get_message` slot.
    pub fn lookup(self: &Arc<Self>) -> MessageLookup {
        let store = Arc::clone(self);
        Arc::new(move |chat_id, message_id| store.load_message(chat_id, message_id))
    }
}
