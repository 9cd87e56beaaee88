//! Permission decisions for command dispatch.
//!
//! Pure decision logic over a resolved descriptor plus the sender's standing,
//! fronted by a small TTL cache keyed `(plugin, sender, chat)` so repeated
//! commands in busy groups skip the group-metadata lookup.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::plugin::{PluginCategory, PluginDescriptor};

/// Cache TTL for permission decisions.
pub const CACHE_TTL: Duration = Duration::from_secs(30);

/// Cache capacity.
const CACHE_CAPACITY: usize = 500;

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run the command.
    Allow,
    /// Drop without any reply.
    DenySilent,
    /// Refuse with a user-facing message.
    Deny {
        /// Reply text.
        message: String,
    },
}

/// Everything the decision depends on.
#[derive(Debug, Clone, Copy)]
pub struct PermissionInput<'a> {
    /// The resolved plugin.
    pub descriptor: &'a PluginDescriptor,
    /// Whether the chat is a group.
    pub is_group: bool,
    /// Sender phone equals the session's own phone.
    pub is_creator: bool,
    /// Sender is admin in the originating group.
    pub is_group_admin: bool,
    /// Sender's mapped account is VIP.
    pub is_vip: bool,
}

/// Decide whether a sender may run a command.
pub fn check(input: &PermissionInput<'_>) -> Decision {
    let d = input.descriptor;
    let has_bit = |bit: &str| d.permissions.iter().any(|p| p == bit);

    let needs_owner = d.owner_only || has_bit("owner") || d.category == PluginCategory::Owner;
    let needs_admin = d.admin_only || has_bit("admin") || d.category == PluginCategory::GroupMenu;
    let needs_vip = d.vip_only || has_bit("vip");

    // Public menu commands pass without further checks.
    let menu_category = matches!(
        d.category,
        PluginCategory::MainMenu | PluginCategory::GameMenu
    );
    if menu_category && !needs_owner && !needs_admin && !needs_vip {
        return Decision::Allow;
    }

    if needs_vip && !(input.is_vip || input.is_creator) {
        return Decision::Deny {
            message: "This command is available to VIP users only.".to_string(),
        };
    }

    if needs_owner && !input.is_creator {
        return Decision::Deny {
            message: "Only the bot owner can use this command.".to_string(),
        };
    }

    if needs_admin {
        if !input.is_group {
            return Decision::Deny {
                message: "This command only works in groups.".to_string(),
            };
        }
        if !(input.is_group_admin || input.is_creator) {
            return Decision::Deny {
                message: "This command requires group admin.".to_string(),
            };
        }
    }

    // Whatever remains is a gated non-menu command: only the creator (or a
    // group admin, in groups) may reach it, and refusals stay silent.
    if input.is_group && !(input.is_creator || input.is_group_admin) {
        return Decision::DenySilent;
    }
    if !input.is_group && d.category == PluginCategory::Mode && !input.is_creator {
        return Decision::DenySilent;
    }

    Decision::Allow
}

struct CachedDecision {
    decision: Decision,
    at: Instant,
}

/// TTL + LRU cache over [`check`] results.
pub struct PermissionCache {
    inner: Mutex<LruCache<(String, String, String), CachedDecision>>,
    ttl: Duration,
}

impl PermissionCache {
    /// Cache with production TTL.
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    /// Cache with a custom TTL (tests).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
            ttl,
        }
    }

    /// Fresh cached decision, if any.
    pub fn get(&self, plugin_id: &str, sender_id: &str, chat_id: &str) -> Option<Decision> {
        let key = (
            plugin_id.to_string(),
            sender_id.to_string(),
            chat_id.to_string(),
        );
        let mut cache = self.inner.lock().unwrap();
        match cache.get(&key) {
            Some(cached) if cached.at.elapsed() < self.ttl => Some(cached.decision.clone()),
            _ => None,
        }
    }

    /// Store a decision.
    pub fn put(&self, plugin_id: &str, sender_id: &str, chat_id: &str, decision: Decision) {
        let key = (
            plugin_id.to_string(),
            sender_id.to_string(),
            chat_id.to_string(),
        );
        self.inner.lock().unwrap().put(
            key,
            CachedDecision {
                decision,
                at: Instant::now(),
            },
        );
    }

    /// Number of cached decisions.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new()
    }
}
