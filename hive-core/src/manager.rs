//! Session lifecycle and registry.
//!
//! The SessionManager owns the `session_id → driver` mapping — the only
//! place a live socket is held. Everything else passes session ids around
//! as values. One manager hosts the whole fleet: it creates sessions,
//! reacts to connection lifecycle events, schedules reconnects according to
//! the ConnectionManager's classification, sweeps health, and tears
//! everything down on shutdown.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthHandle, AuthStore};
use crate::channel_join::ChannelJoiner;
use crate::connection::{ConnectError, ConnectionManager, DisconnectDecision};
use crate::control::{ControlEvent, ControlNotifier};
use crate::dispatch::{Dispatcher, SessionContext};
use crate::driver::{
    ConnectionState, DisconnectReason, DriverError, DriverEvent, MessageContent, SendOptions,
    SentMessage, SocketDriver, TransportState, UpsertKind,
};
use crate::group_cache::GroupCache;
use crate::message_store::MessageStore;
use crate::outbound::Outbound;
use crate::session::{ConnectionStatus, SessionRecord, SessionSource, session_id_for};
use crate::store::{SessionStore, StoreError};

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No such session in the registry.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Connection setup failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Metadata persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An outbound driver operation failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Manager tuning, defaulted for production and shrunk by tests.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Pause between connection open and flushing the driver's buffered
    /// events, so the message index consumes initial sync first.
    pub open_flush_delay: Duration,
    /// Health sweep cadence.
    pub health_interval: Duration,
    /// Idle time after which a connected session gets a liveness probe.
    pub inactive_probe_after: Duration,
    /// Idle time after which per-session auxiliary state is dropped.
    pub aux_drop_after: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            open_flush_delay: Duration::from_secs(2),
            health_interval: Duration::from_secs(60),
            inactive_probe_after: Duration::from_secs(30 * 60),
            aux_drop_after: Duration::from_secs(10 * 60),
        }
    }
}

/// Fleet-level counters for the stats surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagerStats {
    /// Sessions in the registry.
    pub total: usize,
    /// Fully connected.
    pub connected: usize,
    /// Mid-handshake.
    pub connecting: usize,
    /// Present but down.
    pub disconnected: usize,
    /// Sessions with a pairing attempt in flight.
    pub pairing: usize,
}

/// Everything the manager tracks per live session.
struct SessionEntry {
    driver: Arc<dyn SocketDriver>,
    auth: AuthHandle,
    message_store: Arc<MessageStore>,
    pairing_code: Arc<StdMutex<Option<String>>>,
    status: ConnectionStatus,
    last_activity: Instant,
    voluntarily_disconnected: bool,
    initializing: bool,
    restart_515: u32,
    handlers_installed: bool,
    connect_notified: bool,
    cancel: CancellationToken,
    user_id: String,
    phone_number: String,
    source: SessionSource,
}

/// The fleet registry and lifecycle engine.
pub struct SessionManager {
    registry: DashMap<String, SessionEntry>,
    store: Arc<dyn SessionStore>,
    auth: Arc<AuthStore>,
    connections: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    groups: Arc<GroupCache>,
    outbound: Arc<Outbound>,
    notifier: Arc<dyn ControlNotifier>,
    joiner: Option<Arc<ChannelJoiner>>,
    settings: ManagerSettings,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Assemble the manager over the shared subsystems.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SessionStore>,
        auth: Arc<AuthStore>,
        connections: Arc<ConnectionManager>,
        dispatcher: Arc<Dispatcher>,
        groups: Arc<GroupCache>,
        outbound: Arc<Outbound>,
        notifier: Arc<dyn ControlNotifier>,
        joiner: Option<Arc<ChannelJoiner>>,
        settings: ManagerSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: DashMap::new(),
            store,
            auth,
            connections,
            dispatcher,
            groups,
            outbound,
            notifier,
            joiner,
            settings,
            cancel,
        })
    }

    /// Start the background machinery: health monitor, channel-join worker,
    /// dispatcher temp-state sweeper.
    pub fn start(self: &Arc<Self>) {
        self.spawn_health_monitor();
        self.dispatcher.spawn_sweeper(self.cancel.child_token());

        if let Some(joiner) = &self.joiner {
            let weak = Arc::downgrade(self);
            let resolve: crate::channel_join::DriverResolver = Arc::new(move |session_id| {
                weak.upgrade()
                    .and_then(|manager| manager.get_session(session_id))
            });
            joiner.spawn_worker(resolve, self.cancel.child_token());
        }
    }

    /// Create (or re-create) a session and connect it.
    ///
    /// Any existing socket for the same id is torn down first, keeping the
    /// at-most-one-live-socket invariant. The session row is persisted in
    /// `connecting` state before the driver is built.
    ///
    /// # Errors
    ///
    /// Propagates connection and store failures; on connection failure the
    /// row is left persisted as disconnected.
    pub async fn create_session(
        self: &Arc<Self>,
        user_id: &str,
        phone_number: &str,
        source: SessionSource,
        is_reconnect: bool,
        allow_pairing: bool,
    ) -> Result<Arc<dyn SocketDriver>, ManagerError> {
        let session_id = session_id_for(user_id);
        tracing::info!(session_id, is_reconnect, allow_pairing, "creating session");

        // Replace-not-duplicate: the old socket dies before the new one is born.
        let prior_restarts = match self.registry.remove(&session_id) {
            Some((_, old)) => {
                old.cancel.cancel();
                old.driver.close().await;
                let _ = old.auth.close().await;
                old.restart_515
            }
            None => 0,
        };

        let mut record = if is_reconnect {
            match self.store.get_session(&session_id).await? {
                Some(existing) => existing,
                None => SessionRecord::new(user_id, phone_number, source),
            }
        } else {
            SessionRecord::new(user_id, phone_number, source)
        };
        record.phone_number = phone_number.to_string();
        record.connection_status = ConnectionStatus::Connecting;
        record.voluntarily_disconnected = false;
        record.updated_at = Utc::now();
        self.store.upsert_session(&record).await?;

        let message_store = MessageStore::new();
        let session_cancel = self.cancel.child_token();

        let connection = match self
            .connections
            .create_connection(
                &session_id,
                Some(phone_number),
                &message_store,
                allow_pairing,
                session_cancel.clone(),
            )
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                let _ = self
                    .store
                    .set_connection_state(
                        &session_id,
                        ConnectionStatus::Disconnected,
                        record.reconnect_attempts,
                    )
                    .await;
                return Err(e.into());
            }
        };

        let driver = Arc::clone(&connection.driver);
        self.registry.insert(
            session_id.clone(),
            SessionEntry {
                driver: Arc::clone(&driver),
                auth: connection.auth,
                message_store,
                pairing_code: connection.pairing_code,
                status: ConnectionStatus::Connecting,
                last_activity: Instant::now(),
                voluntarily_disconnected: false,
                initializing: true,
                restart_515: prior_restarts,
                handlers_installed: false,
                connect_notified: false,
                cancel: session_cancel.clone(),
                user_id: user_id.to_string(),
                phone_number: phone_number.to_string(),
                source,
            },
        );
        self.spawn_event_loop(session_id.clone(), Arc::clone(&driver), session_cancel);

        // Fast transports open before our subscription exists; catch up
        // without holding the caller through the flush delay.
        if driver.transport_state() == TransportState::Open {
            let manager = Arc::clone(self);
            let opened_id = session_id.clone();
            let opened_driver = Arc::clone(&driver);
            tokio::spawn(async move {
                manager.on_open(&opened_id, &opened_driver).await;
            });
        }

        Ok(driver)
    }

    /// The live driver for a session, if any.
    pub fn get_session(&self, session_id: &str) -> Option<Arc<dyn SocketDriver>> {
        self.registry
            .get(session_id)
            .map(|e| Arc::clone(&e.driver))
    }

    /// The most recent pairing code issued for a session.
    pub fn get_pairing_code(&self, session_id: &str) -> Option<String> {
        self.registry
            .get(session_id)
            .and_then(|e| e.pairing_code.lock().unwrap().clone())
    }

    /// Registry status plus a live transport plus an authenticated identity.
    pub fn is_really_connected(&self, session_id: &str) -> bool {
        let Some(entry) = self.registry.get(session_id) else {
            return false;
        };
        entry.status == ConnectionStatus::Connected
            && entry.driver.transport_state() == TransportState::Open
            && entry.driver.user().is_some()
    }

    /// Fleet counters.
    pub fn get_stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            total: 0,
            connected: 0,
            connecting: 0,
            disconnected: 0,
            pairing: 0,
        };
        for entry in self.registry.iter() {
            stats.total += 1;
            match entry.status {
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Connecting => stats.connecting += 1,
                ConnectionStatus::Disconnected => stats.disconnected += 1,
            }
            if self.connections.is_pairing(entry.key()) {
                stats.pairing += 1;
            }
        }
        stats
    }

    /// Voluntarily disconnect a session. With `force_cleanup` every trace is
    /// removed; otherwise the registry entry and the session row survive for
    /// a later reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::NotFound`] when the session is not hosted.
    pub async fn disconnect_session(
        self: &Arc<Self>,
        session_id: &str,
        force_cleanup: bool,
    ) -> Result<(), ManagerError> {
        let (driver, auth) = {
            let Some(mut entry) = self.registry.get_mut(session_id) else {
                return Err(ManagerError::NotFound(session_id.to_string()));
            };
            entry.voluntarily_disconnected = true;
            entry.status = ConnectionStatus::Disconnected;
            entry.cancel.cancel();
            (Arc::clone(&entry.driver), entry.auth.clone())
        };

        driver.close().await;
        let _ = auth.close().await;
        let _ = self
            .store
            .set_voluntarily_disconnected(session_id, true)
            .await;
        let _ = self
            .store
            .set_connection_state(session_id, ConnectionStatus::Disconnected, 0)
            .await;

        if force_cleanup {
            self.perform_complete_user_cleanup(session_id).await?;
        }
        tracing::info!(session_id, force_cleanup, "session disconnected");
        Ok(())
    }

    /// Remove every trace of a session: socket, registry entry, auth
    /// material, and the session row.
    ///
    /// # Errors
    ///
    /// Propagates auth-store failures; the registry entry is removed
    /// regardless.
    pub async fn perform_complete_user_cleanup(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Result<(), ManagerError> {
        if let Some((_, entry)) = self.registry.remove(session_id) {
            entry.cancel.cancel();
            // Best effort: invalidate the pairing server-side before the
            // socket goes away.
            let _ = entry.driver.logout().await;
            entry.driver.close().await;
            let _ = entry.auth.close().await;
        }
        self.auth.cleanup(session_id).await.map_err(ConnectError::Auth)?;
        let _ = self.store.delete_session(session_id).await;
        tracing::info!(session_id, "complete cleanup finished");
        Ok(())
    }

    /// Reconnect every restorable persisted session at boot. Returns how
    /// many reconnects were attempted.
    pub async fn restore_sessions(self: &Arc<Self>) -> usize {
        let rows = match self.store.list_sessions().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "session restore listing failed");
                return 0;
            }
        };

        let mut attempted = 0;
        for row in rows {
            if row.voluntarily_disconnected {
                continue;
            }
            if !self.auth.has_valid(&row.session_id).await {
                tracing::debug!(session_id = row.session_id, "skipping restore without valid auth");
                continue;
            }
            attempted += 1;
            if let Err(e) = self
                .create_session(&row.user_id, &row.phone_number, row.source, true, false)
                .await
            {
                tracing::warn!(session_id = row.session_id, error = %e, "restore failed");
            }
        }
        attempted
    }

    /// Send a text message from a hosted session, stamping activity.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown sessions, the final
    /// [`DriverError`] when the wrapped send gives up.
    pub async fn send_text(
        &self,
        session_id: &str,
        jid: &str,
        text: &str,
    ) -> Result<SentMessage, ManagerError> {
        let driver = self
            .get_session(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        let sent = self
            .outbound
            .send(
                driver.as_ref(),
                jid,
                MessageContent::text(text),
                SendOptions::default(),
            )
            .await?;
        self.note_activity(session_id).await;
        Ok(sent)
    }

    /// Stamp message activity for a session.
    pub async fn note_activity(&self, session_id: &str) {
        if let Some(mut entry) = self.registry.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
        let _ = self.store.touch_last_message(session_id, Utc::now()).await;
    }

    /// One health pass over the fleet: probe long-idle connected sessions,
    /// reclaim auxiliary state of inactive ones.
    pub async fn run_health_sweep(self: &Arc<Self>) {
        struct Probe {
            session_id: String,
            user_id: String,
            phone_number: String,
            source: SessionSource,
            idle: Duration,
            status: ConnectionStatus,
            driver: Arc<dyn SocketDriver>,
            message_store: Arc<MessageStore>,
        }

        let probes: Vec<Probe> = self
            .registry
            .iter()
            .map(|entry| Probe {
                session_id: entry.key().clone(),
                user_id: entry.user_id.clone(),
                phone_number: entry.phone_number.clone(),
                source: entry.source,
                idle: entry.last_activity.elapsed(),
                status: entry.status,
                driver: Arc::clone(&entry.driver),
                message_store: Arc::clone(&entry.message_store),
            })
            .collect();

        for probe in probes {
            if probe.status == ConnectionStatus::Connected
                && probe.idle > self.settings.inactive_probe_after
            {
                let alive = probe.driver.transport_state() == TransportState::Open
                    && probe.driver.user().is_some();
                if !alive {
                    tracing::warn!(
                        session_id = probe.session_id,
                        idle_secs = probe.idle.as_secs(),
                        "liveness probe failed, reconnecting"
                    );
                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        let _ = manager
                            .create_session(
                                &probe.user_id,
                                &probe.phone_number,
                                probe.source,
                                true,
                                false,
                            )
                            .await;
                    });
                    continue;
                }
            }

            if probe.idle > self.settings.aux_drop_after && !probe.message_store.is_empty() {
                tracing::debug!(
                    session_id = probe.session_id,
                    "dropping auxiliary state of inactive session"
                );
                probe.message_store.clear();
            }
        }
    }

    /// Close every socket in parallel, stop all timers, clear the registry.
    pub async fn shutdown(self: &Arc<Self>) {
        tracing::info!(sessions = self.registry.len(), "shutting down session manager");
        self.cancel.cancel();

        let entries: Vec<(String, Arc<dyn SocketDriver>, AuthHandle)> = self
            .registry
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(&e.driver), e.auth.clone()))
            .collect();

        futures::future::join_all(entries.iter().map(|(_, driver, auth)| async move {
            driver.close().await;
            let _ = auth.close().await;
        }))
        .await;

        for (session_id, _, _) in &entries {
            let _ = self
                .store
                .set_connection_state(session_id, ConnectionStatus::Disconnected, 0)
                .await;
        }
        self.registry.clear();
    }

    fn spawn_health_monitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let interval = self.settings.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_health_sweep().await,
                    () = cancel.cancelled() => return,
                }
            }
        });
    }

    fn spawn_event_loop(
        self: &Arc<Self>,
        session_id: String,
        driver: Arc<dyn SocketDriver>,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        let mut events = driver.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    () = cancel.cancelled() => return,
                };
                match event {
                    Ok(event) => {
                        manager.handle_driver_event(&session_id, &driver, event).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(session_id, skipped, "event loop lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    async fn handle_driver_event(
        self: &Arc<Self>,
        session_id: &str,
        driver: &Arc<dyn SocketDriver>,
        event: DriverEvent,
    ) {
        match &event {
            DriverEvent::ConnectionUpdate { state, reason } => {
                match state {
                    ConnectionState::Connecting => {
                        if let Some(mut entry) = self.registry.get_mut(session_id) {
                            entry.status = ConnectionStatus::Connecting;
                        }
                    }
                    ConnectionState::Open => self.on_open(session_id, driver).await,
                    ConnectionState::Close => self.on_close(session_id, reason.clone()).await,
                }
                return;
            }
            DriverEvent::GroupsUpdate { .. } | DriverEvent::GroupParticipantsUpdate { .. } => {
                self.groups.handle_event(driver.as_ref(), &event).await;
            }
            DriverEvent::MessagesUpsert { kind, .. } => {
                if *kind == UpsertKind::Notify {
                    self.note_activity(session_id).await;
                }
            }
            DriverEvent::LidMappingUpdate { lid, phone_jid } => {
                let _ = driver.store_lid_mapping(lid, phone_jid).await;
            }
            _ => {}
        }

        let context = {
            let Some(entry) = self.registry.get(session_id) else {
                return;
            };
            if !entry.handlers_installed {
                return;
            }
            SessionContext {
                session_id: session_id.to_string(),
                user_id: entry.user_id.clone(),
            }
        };
        self.dispatcher.handle_event(&context, driver, &event).await;
    }

    async fn on_open(self: &Arc<Self>, session_id: &str, driver: &Arc<dyn SocketDriver>) {
        let (source, first_open, phone_number) = {
            let Some(mut entry) = self.registry.get_mut(session_id) else {
                return;
            };
            if entry.status == ConnectionStatus::Connected && entry.handlers_installed {
                return;
            }
            entry.status = ConnectionStatus::Connected;
            entry.initializing = false;
            entry.voluntarily_disconnected = false;
            entry.last_activity = Instant::now();
            let first = !entry.connect_notified;
            entry.connect_notified = true;
            (entry.source, first, entry.phone_number.clone())
        };

        tracing::info!(session_id, "session connected");
        let _ = self
            .store
            .set_connection_state(session_id, ConnectionStatus::Connected, 0)
            .await;
        let _ = self
            .store
            .set_voluntarily_disconnected(session_id, false)
            .await;

        // Let the message index drain initial sync before releasing the
        // driver's buffered backlog. Handlers install strictly after.
        tokio::time::sleep(self.settings.open_flush_delay).await;
        driver.flush_buffered_events().await;
        if let Some(mut entry) = self.registry.get_mut(session_id) {
            entry.handlers_installed = true;
        }

        if source == SessionSource::Telegram && first_open {
            self.notifier
                .notify(ControlEvent::Connected {
                    session_id: session_id.to_string(),
                    phone_number,
                })
                .await;
        }

        if let Some(joiner) = &self.joiner {
            joiner.enqueue(session_id);
        }
    }

    async fn on_close(self: &Arc<Self>, session_id: &str, reason: Option<DisconnectReason>) {
        let (user_id, phone_number, source, voluntary) = {
            let Some(mut entry) = self.registry.get_mut(session_id) else {
                return;
            };
            entry.status = ConnectionStatus::Disconnected;
            (
                entry.user_id.clone(),
                entry.phone_number.clone(),
                entry.source,
                entry.voluntarily_disconnected,
            )
        };
        // Reconnect attempts live in the persisted row.
        let attempts = match self.store.get_session(session_id).await {
            Ok(Some(row)) => row.reconnect_attempts,
            _ => 0,
        };

        if voluntary {
            let _ = self
                .store
                .set_connection_state(session_id, ConnectionStatus::Disconnected, attempts)
                .await;
            tracing::info!(session_id, "voluntary disconnect, not reconnecting");
            return;
        }

        let reason = reason.unwrap_or_else(|| DisconnectReason::new(428, "connection closed"));
        let decision = self.connections.classify_disconnect(&reason, attempts);
        tracing::info!(
            session_id,
            code = reason.code,
            ?decision,
            "connection closed"
        );

        match decision {
            DisconnectDecision::Reconnect { delay } => {
                let _ = self
                    .store
                    .set_connection_state(
                        session_id,
                        ConnectionStatus::Disconnected,
                        attempts + 1,
                    )
                    .await;
                self.spawn_reconnect(user_id, phone_number, source, delay, false);
            }
            DisconnectDecision::Reinitialize => {
                if let Some(mut entry) = self.registry.get_mut(session_id) {
                    entry.restart_515 += 1;
                }
                let _ = self
                    .store
                    .set_connection_state(session_id, ConnectionStatus::Disconnected, attempts)
                    .await;
                self.spawn_reconnect(user_id, phone_number, source, Duration::ZERO, false);
            }
            DisconnectDecision::Permanent { logged_out } => {
                if logged_out {
                    match source {
                        SessionSource::Web => {
                            // Web sessions disappear entirely on logout.
                            let _ = self.perform_complete_user_cleanup(session_id).await;
                        }
                        SessionSource::Telegram => {
                            // Telegram sessions keep their row so the user
                            // can re-pair; the dead auth material goes.
                            let _ = self.auth.cleanup(session_id).await;
                            let _ = self
                                .store
                                .set_connection_state(
                                    session_id,
                                    ConnectionStatus::Disconnected,
                                    attempts,
                                )
                                .await;
                            self.notifier
                                .notify(ControlEvent::LoggedOut {
                                    session_id: session_id.to_string(),
                                })
                                .await;
                        }
                    }
                } else {
                    let _ = self
                        .store
                        .set_connection_state(
                            session_id,
                            ConnectionStatus::Disconnected,
                            attempts,
                        )
                        .await;
                }
            }
        }
    }

    fn spawn_reconnect(
        self: &Arc<Self>,
        user_id: String,
        phone_number: String,
        source: SessionSource,
        delay: Duration,
        allow_pairing: bool,
    ) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return,
            }
            let session_id = session_id_for(&user_id);
            let still_wanted = manager
                .registry
                .get(&session_id)
                .map(|e| !e.voluntarily_disconnected)
                .unwrap_or(true);
            if !still_wanted {
                return;
            }
            if let Err(e) = manager
                .create_session(&user_id, &phone_number, source, true, allow_pairing)
                .await
            {
                tracing::warn!(session_id, error = %e, "reconnect attempt failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::encode_buffer;
    use crate::config::StorageMode;
    use crate::connection::ConnectSettings;
    use crate::control::RecordingNotifier;
    use crate::dedup::DedupLedger;
    use crate::driver::mock::{MockDriver, MockDriverFactory};
    use crate::plugin::PluginHost;
    use crate::rate_bucket::RateBucket;
    use crate::store::SqliteSessionStore;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        manager: Arc<SessionManager>,
        factory: Arc<MockDriverFactory>,
        auth_store: Arc<AuthStore>,
        store: Arc<dyn SessionStore>,
        notifier: Arc<RecordingNotifier>,
        joiner: Arc<ChannelJoiner>,
        _dir: TempDir,
    }

    fn fast_connect_settings() -> ConnectSettings {
        ConnectSettings {
            pairing_poll_interval: Duration::from_millis(10),
            pairing_wait_timeout: Duration::from_millis(300),
            pairing_grace: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            store_bind_delay: Duration::ZERO,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(20),
            enable_515_flow: false,
        }
    }

    fn fast_manager_settings() -> ManagerSettings {
        ManagerSettings {
            open_flush_delay: Duration::from_millis(10),
            health_interval: Duration::from_secs(60),
            inactive_probe_after: Duration::from_secs(30 * 60),
            aux_drop_after: Duration::from_secs(10 * 60),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(fast_connect_settings()).await
    }

    async fn fixture_with(connect_settings: ConnectSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        let auth_store = AuthStore::new(
            dir.path().join("auth"),
            StorageMode::File,
            None,
            cancel.child_token(),
        );
        let store: Arc<dyn SessionStore> = Arc::new(
            SqliteSessionStore::new(&format!(
                "sqlite:{}",
                dir.path().join("meta.db").display()
            ))
            .await
            .unwrap(),
        );

        let factory = MockDriverFactory::new();
        let connections = ConnectionManager::new(
            Arc::clone(&auth_store),
            Arc::clone(&factory) as Arc<dyn crate::driver::DriverFactory>,
            connect_settings,
        );

        let bucket = Arc::new(RateBucket::with_gap(Duration::from_millis(1)));
        let outbound = Arc::new(Outbound::new(bucket));
        let groups = Arc::new(GroupCache::new());
        let dispatcher = Dispatcher::new(
            PluginHost::new(),
            DedupLedger::new(),
            Arc::clone(&groups),
            Arc::clone(&store),
            Arc::clone(&outbound),
            ".",
        );
        let notifier = Arc::new(RecordingNotifier::new());
        let joiner = ChannelJoiner::new("chan@newsletter");

        let manager = SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&auth_store),
            connections,
            dispatcher,
            groups,
            outbound,
            Arc::clone(&notifier) as Arc<dyn ControlNotifier>,
            Some(Arc::clone(&joiner)),
            fast_manager_settings(),
            cancel,
        );

        Fixture {
            manager,
            factory,
            auth_store,
            store,
            notifier,
            joiner,
            _dir: dir,
        }
    }

    fn registered_creds() -> serde_json::Value {
        json!({
            "noiseKey": encode_buffer(b"noise"),
            "signedIdentityKey": encode_buffer(b"identity"),
            "me": { "id": "15551234567:1@s.whatsapp.net" },
            "account": {},
            "registered": true,
        })
    }

    async fn seed_registered(f: &Fixture, session_id: &str) {
        let handle = f.auth_store.open(session_id).await.unwrap();
        handle.save_creds(&registered_creds()).await.unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_connected(f: &Fixture, session_id: &str) {
        for _ in 0..300 {
            if f.manager.is_really_connected(session_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never connected");
    }

    #[tokio::test]
    async fn test_fresh_pairing_session_connects() {
        let f = fixture().await;
        let driver = MockDriver::new().with_user("15551234567:1@s.whatsapp.net");
        driver.script_pairing(Ok("FRESH-CODE".to_string()));
        f.factory.stage(driver);

        f.manager
            .create_session("42", "15551234567", SessionSource::Telegram, false, true)
            .await
            .unwrap();

        wait_connected(&f, "session_42").await;

        // The pairing code is fetchable through the manager.
        wait_until(|| f.manager.get_pairing_code("session_42").is_some()).await;
        assert_eq!(
            f.manager.get_pairing_code("session_42").as_deref(),
            Some("FRESH-CODE")
        );

        // Pairing completes: the driver hands over registered creds.
        let mock = f.factory.last_created().unwrap();
        mock.emit(DriverEvent::CredsUpdate {
            creds: registered_creds(),
        });
        for _ in 0..300 {
            if f.auth_store.has_valid("session_42").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.auth_store.has_valid("session_42").await);

        // Persisted row reflects the open connection with zero attempts.
        let row = f.store.get_session("session_42").await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Connected);
        assert_eq!(row.reconnect_attempts, 0);

        // Channel join enqueued exactly once.
        assert_eq!(f.joiner.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_registry_holds_one_live_socket_per_session() {
        let f = fixture().await;
        seed_registered(&f, "session_42").await;

        let first = f
            .manager
            .create_session("42", "15551234567", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_42").await;

        let _second = f
            .manager
            .create_session("42", "15551234567", SessionSource::Web, true, false)
            .await
            .unwrap();

        // The old socket was closed, and only one entry remains.
        let (_, old_mock) = &f.factory.created()[0];
        assert!(old_mock.close_count() >= 1, "replaced socket closed");
        assert_eq!(f.manager.get_stats().total, 1);
        assert_eq!(first.transport_state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_open_flushes_buffered_events_and_notifies_control() {
        let f = fixture().await;
        seed_registered(&f, "session_42").await;

        let driver = MockDriver::new().with_user("15551234567:1@s.whatsapp.net");
        driver.buffer_event(DriverEvent::Call {
            from: "x@s.whatsapp.net".to_string(),
            id: "c1".to_string(),
        });
        f.factory.stage(Arc::clone(&driver));

        f.manager
            .create_session("42", "15551234567", SessionSource::Telegram, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_42").await;

        wait_until(|| driver.flush_count() >= 1).await;

        wait_until(|| !f.notifier.events().is_empty()).await;
        let events = f.notifier.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ControlEvent::Connected { session_id, phone_number }
                if session_id == "session_42" && phone_number == "15551234567"
        ));
    }

    #[tokio::test]
    async fn test_web_sessions_do_not_notify_control() {
        let f = fixture().await;
        seed_registered(&f, "session_7").await;

        let driver = MockDriver::new().with_user("15550000007:1@s.whatsapp.net");
        f.factory.stage(driver);
        f.manager
            .create_session("7", "15550000007", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_7").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn test_voluntary_disconnect_suppresses_reconnect() {
        let f = fixture().await;
        seed_registered(&f, "session_42").await;
        f.manager
            .create_session("42", "15551234567", SessionSource::Telegram, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_42").await;

        f.manager
            .disconnect_session("session_42", false)
            .await
            .unwrap();

        assert!(!f.manager.is_really_connected("session_42"));
        let row = f.store.get_session("session_42").await.unwrap().unwrap();
        assert!(row.voluntarily_disconnected);
        assert_eq!(row.connection_status, ConnectionStatus::Disconnected);

        // No new drivers appear: nothing schedules a reconnect.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.factory.created().len(), 1);
        // The row survives for a later manual reconnect.
        assert!(f.store.get_session("session_42").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_force_cleanup_removes_every_trace() {
        let f = fixture().await;
        seed_registered(&f, "session_42").await;
        f.manager
            .create_session("42", "15551234567", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_42").await;

        f.manager
            .disconnect_session("session_42", true)
            .await
            .unwrap();

        assert!(f.manager.get_session("session_42").is_none());
        assert!(!f.auth_store.has_valid("session_42").await);
        assert!(f.store.get_session("session_42").await.unwrap().is_none());
        assert_eq!(f.manager.get_stats().total, 0);
    }

    #[tokio::test]
    async fn test_transient_close_schedules_reconnect() {
        let f = fixture().await;
        seed_registered(&f, "session_42").await;
        f.manager
            .create_session("42", "15551234567", SessionSource::Telegram, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_42").await;

        let mock = f.factory.last_created().unwrap();
        mock.set_transport(TransportState::Closed);
        mock.emit(DriverEvent::ConnectionUpdate {
            state: ConnectionState::Close,
            reason: Some(DisconnectReason::new(408, "timed out")),
        });

        wait_until(|| f.factory.created().len() >= 2).await;
        wait_connected(&f, "session_42").await;

        let row = f.store.get_session("session_42").await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Connected);
        assert_eq!(row.reconnect_attempts, 0, "attempts reset on open");
    }

    #[tokio::test]
    async fn test_web_logout_deletes_session_entirely() {
        let f = fixture().await;
        seed_registered(&f, "session_w7").await;
        f.manager
            .create_session("w7", "15557770000", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_w7").await;

        let mock = f.factory.last_created().unwrap();
        mock.set_transport(TransportState::Closed);
        mock.emit(DriverEvent::ConnectionUpdate {
            state: ConnectionState::Close,
            reason: Some(DisconnectReason::new(401, "logged out")),
        });

        wait_until(|| f.manager.get_session("session_w7").is_none()).await;
        for _ in 0..300 {
            if f.store.get_session("session_w7").await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.store.get_session("session_w7").await.unwrap().is_none());
        assert!(!f.auth_store.has_valid("session_w7").await);

        // No reconnect was scheduled.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.factory.created().len(), 1);
    }

    #[tokio::test]
    async fn test_telegram_logout_keeps_row_for_repairing() {
        let f = fixture().await;
        seed_registered(&f, "session_t1").await;
        f.manager
            .create_session("t1", "15551110000", SessionSource::Telegram, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_t1").await;

        let mock = f.factory.last_created().unwrap();
        mock.set_transport(TransportState::Closed);
        mock.emit(DriverEvent::ConnectionUpdate {
            state: ConnectionState::Close,
            reason: Some(DisconnectReason::new(440, "replaced")),
        });

        for _ in 0..300 {
            if !f.auth_store.has_valid("session_t1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.auth_store.has_valid("session_t1").await, "auth wiped");

        let row = f.store.get_session("session_t1").await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Disconnected);

        wait_until(|| {
            f.notifier
                .events()
                .iter()
                .any(|e| matches!(e, ControlEvent::LoggedOut { .. }))
        })
        .await;
    }

    #[tokio::test]
    async fn test_restore_sessions_reconnects_persisted_rows() {
        let f = fixture().await;
        seed_registered(&f, "session_a").await;
        seed_registered(&f, "session_b").await;

        // Three rows: two restorable, one voluntarily disconnected.
        for (user, phone) in [("a", "1555000001"), ("b", "1555000002")] {
            f.store
                .upsert_session(&SessionRecord::new(user, phone, SessionSource::Telegram))
                .await
                .unwrap();
        }
        let mut gone = SessionRecord::new("c", "1555000003", SessionSource::Web);
        gone.voluntarily_disconnected = true;
        f.store.upsert_session(&gone).await.unwrap();

        let attempted = f.manager.restore_sessions().await;
        assert_eq!(attempted, 2, "voluntary and auth-less rows are skipped");
        wait_connected(&f, "session_a").await;
        wait_connected(&f, "session_b").await;
    }

    #[tokio::test]
    async fn test_send_text_goes_through_wrapper_and_stamps_activity() {
        let f = fixture().await;
        seed_registered(&f, "session_42").await;
        f.manager
            .create_session("42", "15551234567", SessionSource::Telegram, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_42").await;

        f.manager
            .send_text("session_42", "peer@s.whatsapp.net", "hello")
            .await
            .unwrap();

        let mock = f.factory.last_created().unwrap();
        assert_eq!(mock.delivered().len(), 1);
        assert_eq!(
            mock.delivered()[0].options.ephemeral_expiration,
            Some(0),
            "wrapper default applied"
        );

        let row = f.store.get_session("session_42").await.unwrap().unwrap();
        assert!(row.last_message_at.is_some());

        let missing = f
            .manager
            .send_text("session_none", "peer@s.whatsapp.net", "x")
            .await;
        assert!(matches!(missing, Err(ManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stats_reflect_fleet() {
        let f = fixture().await;
        seed_registered(&f, "session_1").await;
        f.manager
            .create_session("1", "15550000001", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_1").await;

        let stats = f.manager.get_stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.disconnected, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_sockets() {
        let f = fixture().await;
        seed_registered(&f, "session_1").await;
        seed_registered(&f, "session_2").await;
        f.manager
            .create_session("1", "15550000001", SessionSource::Web, false, false)
            .await
            .unwrap();
        f.manager
            .create_session("2", "15550000002", SessionSource::Telegram, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_1").await;
        wait_connected(&f, "session_2").await;

        f.manager.shutdown().await;

        assert_eq!(f.manager.get_stats().total, 0);
        for (_, mock) in f.factory.created() {
            assert!(mock.close_count() >= 1);
        }
        let row = f.store.get_session("session_1").await.unwrap().unwrap();
        assert_eq!(row.connection_status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_health_sweep_clears_idle_aux_state() {
        let f = fixture().await;
        seed_registered(&f, "session_1").await;
        f.manager
            .create_session("1", "15550000001", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_1").await;

        // Index something, then make the session look long-idle.
        let mock = f.factory.last_created().unwrap();
        mock.emit(DriverEvent::MessagesUpsert {
            messages: vec![crate::driver::InboundMessage {
                key: crate::driver::MessageKey {
                    chat_id: "c@s.whatsapp.net".to_string(),
                    id: "M1".to_string(),
                    from_me: false,
                    participant: None,
                },
                text: Some("x".to_string()),
                mentions: Vec::new(),
                push_name: None,
                timestamp: Utc::now(),
            }],
            kind: UpsertKind::Append,
        });
        let store_len = || {
            f.manager
                .registry
                .get("session_1")
                .map(|e| e.message_store.len())
                .unwrap_or(0)
        };
        wait_until(|| store_len() == 1).await;

        if let Some(mut entry) = f.manager.registry.get_mut("session_1") {
            entry.last_activity = Instant::now() - Duration::from_secs(11 * 60);
        }
        f.manager.run_health_sweep().await;
        assert_eq!(store_len(), 0, "auxiliary state dropped after inactivity");
    }

    #[tokio::test]
    async fn test_health_sweep_reconnects_dead_connected_session() {
        let f = fixture().await;
        seed_registered(&f, "session_1").await;
        f.manager
            .create_session("1", "15550000001", SessionSource::Web, false, false)
            .await
            .unwrap();
        wait_connected(&f, "session_1").await;

        // The transport silently died and the session has been idle too long.
        let mock = f.factory.last_created().unwrap();
        mock.set_transport(TransportState::Closed);
        if let Some(mut entry) = f.manager.registry.get_mut("session_1") {
            entry.last_activity = Instant::now() - Duration::from_secs(31 * 60);
        }

        f.manager.run_health_sweep().await;
        wait_until(|| f.factory.created().len() >= 2).await;
        wait_connected(&f, "session_1").await;
    }
}
