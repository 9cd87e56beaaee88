//! Group metadata cache.
//!
//! Cache-first with a short TTL, event-driven invalidation, and graceful
//! degradation under rate limiting: expired entries are retained so a
//! rate-limited fetch can serve stale data, and an empty cache yields a
//! minimal fallback instead of an error. A forbidden fetch means the bot
//! left the group; the entry is evicted and the caller gets `None`.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;

use crate::driver::{
    AdminRole, DriverError, DriverEvent, GroupMetadata, GroupUpdate, Participant, SocketDriver,
    jid_phone, phone_to_jid,
};

/// Entry freshness window.
pub const ENTRY_TTL: Duration = Duration::from_secs(60);

/// Hard capacity of the cache.
const CAPACITY: usize = 500;

/// Flush threshold: inserts trim the cache back down to this size.
const FLUSH_AT: usize = 300;

/// Subject used for the rate-limited fallback skeleton.
pub const RATE_LIMITED_SUBJECT: &str = "Unknown Group (Rate Limited)";

/// Errors escaping the cache. Rate limits and forbidden fetches never do.
#[derive(Debug, Error)]
pub enum GroupCacheError {
    /// The driver failed in a way the cache has no fallback for.
    #[error("group metadata fetch failed: {0}")]
    Driver(DriverError),
}

struct CachedGroup {
    meta: GroupMetadata,
    fetched_at: Instant,
}

/// TTL + LRU cache over [`SocketDriver::group_metadata`].
pub struct GroupCache {
    inner: Mutex<LruCache<String, CachedGroup>>,
    ttl: Duration,
}

impl GroupCache {
    /// Cache with production TTL and capacity.
    pub fn new() -> Self {
        Self::with_ttl(ENTRY_TTL)
    }

    /// Cache with a custom TTL (tests).
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(CAPACITY).expect("capacity is non-zero"),
            )),
            ttl,
        }
    }

    /// Fetch metadata for a group, cache-first.
    ///
    /// * Fresh cache hit (and not `force_refresh`): returned immediately.
    /// * Miss or forced: fetched from the driver, normalized, cached.
    /// * Forbidden: entry evicted, `Ok(None)`.
    /// * Rate-limited or timed out: stale entry if one exists, otherwise the
    ///   fallback skeleton. Never an error.
    ///
    /// # Errors
    ///
    /// Returns [`GroupCacheError::Driver`] only for failures without a
    /// fallback (transport faults, protocol errors).
    pub async fn get(
        &self,
        driver: &dyn SocketDriver,
        group_id: &str,
        force_refresh: bool,
    ) -> Result<Option<GroupMetadata>, GroupCacheError> {
        if !force_refresh {
            let mut cache = self.inner.lock().unwrap();
            if let Some(cached) = cache.get(group_id)
                && cached.fetched_at.elapsed() < self.ttl
            {
                return Ok(Some(cached.meta.clone()));
            }
        }

        match driver.group_metadata(group_id).await {
            Ok(meta) => {
                let normalized = normalize_metadata(meta);
                self.insert(normalized.clone());
                Ok(Some(normalized))
            }
            Err(DriverError::Forbidden(reason)) => {
                tracing::debug!(group_id, reason, "evicting group after forbidden fetch");
                self.evict(group_id);
                Ok(None)
            }
            Err(DriverError::RateLimited | DriverError::Timeout) => {
                let stale = self
                    .inner
                    .lock()
                    .unwrap()
                    .get(group_id)
                    .map(|c| c.meta.clone());
                match stale {
                    Some(meta) => {
                        tracing::debug!(group_id, "serving stale group metadata under rate limit");
                        Ok(Some(meta))
                    }
                    None => Ok(Some(rate_limited_fallback(group_id))),
                }
            }
            Err(e) => Err(GroupCacheError::Driver(e)),
        }
    }

    /// Insert normalized metadata, trimming the cache when it outgrows the
    /// flush threshold.
    pub fn insert(&self, meta: GroupMetadata) {
        let mut cache = self.inner.lock().unwrap();
        cache.put(
            meta.id.clone(),
            CachedGroup {
                meta,
                fetched_at: Instant::now(),
            },
        );
        if cache.len() > FLUSH_AT {
            while cache.len() > FLUSH_AT {
                cache.pop_lru();
            }
        }
    }

    /// Drop one entry.
    pub fn evict(&self, group_id: &str) {
        self.inner.lock().unwrap().pop(group_id);
    }

    /// Number of cached groups.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry exists, expired or not. Test and introspection aid.
    pub fn contains(&self, group_id: &str) -> bool {
        self.inner.lock().unwrap().peek(group_id).is_some()
    }

    /// Apply one driver event to the cache.
    ///
    /// Membership changes force a refresh through the driver; announce or
    /// restrict changes evict; other updates merge into the cached entry.
    pub async fn handle_event(&self, driver: &dyn SocketDriver, event: &DriverEvent) {
        match event {
            DriverEvent::GroupsUpdate { updates } => {
                for update in updates {
                    self.apply_update(update);
                }
            }
            DriverEvent::GroupParticipantsUpdate { group_id, action, .. } => {
                tracing::debug!(group_id, ?action, "membership change, refreshing group");
                if let Err(e) = self.get(driver, group_id, true).await {
                    tracing::debug!(group_id, error = %e, "membership refresh failed");
                }
            }
            _ => {}
        }
    }

    fn apply_update(&self, update: &GroupUpdate) {
        if update.announce.is_some() || update.restrict.is_some() {
            tracing::debug!(group_id = update.id, "group settings changed, evicting");
            self.evict(&update.id);
            return;
        }
        let mut cache = self.inner.lock().unwrap();
        if let Some(cached) = cache.get_mut(&update.id)
            && let Some(subject) = &update.subject
        {
            cached.meta.subject = subject.clone();
        }
    }
}

impl Default for GroupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Guarantee every participant carries both a chat-addressable jid and a
/// phone-addressable id; empty strings are rewritten from the other form.
pub fn normalize_metadata(mut meta: GroupMetadata) -> GroupMetadata {
    for participant in &mut meta.participants {
        normalize_participant(participant);
    }
    meta
}

fn normalize_participant(p: &mut Participant) {
    let base = if p.id.is_empty() {
        p.jid
            .clone()
            .filter(|j| !j.is_empty())
            .or_else(|| p.phone_number.clone().filter(|n| !n.is_empty()))
            .unwrap_or_default()
    } else {
        p.id.clone()
    };
    p.id = base.clone();

    match &p.jid {
        Some(jid) if !jid.is_empty() => {}
        _ => p.jid = Some(if base.contains('@') { base.clone() } else { phone_to_jid(&base) }),
    }
    match &p.phone_number {
        Some(phone) if !phone.is_empty() => {}
        _ => p.phone_number = Some(jid_phone(&base).to_string()),
    }
}

/// Minimal non-null answer when the driver is rate limited and nothing is
/// cached.
fn rate_limited_fallback(group_id: &str) -> GroupMetadata {
    GroupMetadata {
        id: group_id.to_string(),
        subject: RATE_LIMITED_SUBJECT.to_string(),
        participants: Vec::new(),
        announce: false,
        restrict: false,
    }
}

/// Whether a participant holds any admin role. Shared by the permission
/// checks in the dispatcher.
pub fn is_admin(meta: &GroupMetadata, jid_or_phone: &str) -> bool {
    let phone = jid_phone(jid_or_phone);
    meta.participants.iter().any(|p| {
        matches!(p.admin, Some(AdminRole::Admin) | Some(AdminRole::SuperAdmin))
            && (p.id == jid_or_phone
                || p.jid.as_deref() == Some(jid_or_phone)
                || p.phone_number.as_deref() == Some(phone))
    })
}
