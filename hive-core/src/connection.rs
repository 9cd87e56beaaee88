//! Connection management.
//!
//! Builds a driver bound to a session's auth material, keeps creds and the
//! message index fed from the event stream, schedules pairing when the
//! device is not yet registered, and classifies disconnects into the
//! reconnect/permanent decision table the SessionManager acts on.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, AuthHandle, AuthStore};
use crate::driver::{
    DisconnectReason, DriverError, DriverEvent, DriverFactory, SocketDriver, TransportState,
};
use crate::message_store::MessageStore;

/// Errors from connection setup.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The session has no registered creds and pairing was not allowed.
    #[error("no valid auth material for {0}")]
    NoValidAuth(String),

    /// Pairing requires a phone number.
    #[error("pairing requested without a phone number for {0}")]
    MissingPhone(String),

    /// Auth storage failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The driver could not be created or connected.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// What to do after a disconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectDecision {
    /// Schedule a reconnect after the given backoff.
    Reconnect {
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Re-run full session creation (the opt-in 515 flow).
    Reinitialize,
    /// Stop: the session will not come back by itself.
    Permanent {
        /// The device was logged out or replaced; web-source sessions are
        /// deleted entirely, telegram-source sessions are kept for re-pairing.
        logged_out: bool,
    },
}

/// Tuning knobs, defaulted for production and shrunk by tests.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Poll cadence while waiting for the transport before pairing.
    pub pairing_poll_interval: Duration,
    /// How long to wait for the transport before giving up on pairing.
    pub pairing_wait_timeout: Duration,
    /// How long a session stays in the pairing set after scheduling.
    pub pairing_grace: Duration,
    /// Hard bound for a pending connection to reach open.
    pub connect_timeout: Duration,
    /// Delay applied between driver subscription and returning, so the
    /// message index observes initial sync.
    pub store_bind_delay: Duration,
    /// Backoff base for reconnects.
    pub backoff_base: Duration,
    /// Backoff cap.
    pub backoff_cap: Duration,
    /// Re-create instead of reconnecting on a 515 stream restart.
    pub enable_515_flow: bool,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            pairing_poll_interval: Duration::from_millis(100),
            pairing_wait_timeout: Duration::from_secs(30),
            pairing_grace: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(60),
            store_bind_delay: Duration::from_secs(1),
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            enable_515_flow: false,
        }
    }
}

/// A live, auth-bound driver plus its session-scoped handles.
pub struct Connection {
    /// The driver.
    pub driver: Arc<dyn SocketDriver>,
    /// Auth handle feeding `creds.update` persistence.
    pub auth: AuthHandle,
    /// Latest pairing code, filled by the pairing task.
    pub pairing_code: Arc<StdMutex<Option<String>>>,
}

/// Builds connections and classifies their deaths.
pub struct ConnectionManager {
    auth_store: Arc<AuthStore>,
    factory: Arc<dyn DriverFactory>,
    settings: ConnectSettings,
    pairing_in_flight: StdMutex<HashSet<String>>,
}

impl ConnectionManager {
    /// Manager over an auth store and a driver factory.
    pub fn new(
        auth_store: Arc<AuthStore>,
        factory: Arc<dyn DriverFactory>,
        settings: ConnectSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            auth_store,
            factory,
            settings,
            pairing_in_flight: StdMutex::new(HashSet::new()),
        })
    }

    /// The active settings.
    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    /// Whether a pairing attempt is currently tracked for a session.
    pub fn is_pairing(&self, session_id: &str) -> bool {
        self.pairing_in_flight.lock().unwrap().contains(session_id)
    }

    /// Build and start a driver for a session.
    ///
    /// Loads auth material, creates the driver, binds the message index and
    /// creds persistence to the event stream, starts the transport under a
    /// hard open-deadline, and schedules pairing when allowed and needed.
    ///
    /// # Errors
    ///
    /// [`ConnectError::NoValidAuth`] when the device is unregistered and
    /// pairing is not allowed; [`ConnectError::MissingPhone`] when pairing
    /// is needed but no number was given; auth and driver failures otherwise.
    pub async fn create_connection(
        self: &Arc<Self>,
        session_id: &str,
        phone_number: Option<&str>,
        message_store: &Arc<MessageStore>,
        allow_pairing: bool,
        cancel: CancellationToken,
    ) -> Result<Connection, ConnectError> {
        let auth = self.auth_store.open(session_id).await?;

        let needs_pairing = !auth.is_registered();
        if needs_pairing && !allow_pairing {
            return Err(ConnectError::NoValidAuth(session_id.to_string()));
        }
        if needs_pairing && phone_number.is_none() {
            return Err(ConnectError::MissingPhone(session_id.to_string()));
        }

        let driver = self.factory.create(session_id, auth.clone()).await?;
        driver.set_message_lookup(message_store.lookup());

        // Creds persistence and message indexing ride the event stream for
        // the lifetime of the connection.
        spawn_auth_subscriber(
            Arc::clone(&driver),
            auth.clone(),
            Arc::clone(message_store),
            cancel.clone(),
        );

        driver.connect().await?;
        self.spawn_connect_watchdog(Arc::clone(&driver), session_id, cancel.clone());

        // Give the index a beat to consume the driver's initial sync before
        // callers start flushing buffered events.
        if !self.settings.store_bind_delay.is_zero() {
            tokio::time::sleep(self.settings.store_bind_delay).await;
        }

        let pairing_code = Arc::new(StdMutex::new(None));
        if needs_pairing {
            let phone = phone_number.expect("checked above").to_string();
            self.schedule_pairing(
                session_id,
                phone,
                Arc::clone(&driver),
                auth.clone(),
                Arc::clone(&pairing_code),
                cancel,
            );
        }

        Ok(Connection {
            driver,
            auth,
            pairing_code,
        })
    }

    /// Classify a disconnect into the decision table.
    pub fn classify_disconnect(&self, reason: &DisconnectReason, attempts: u32) -> DisconnectDecision {
        match reason.code {
            // Logged out or replaced by another pairing: this socket will
            // never authenticate again.
            401 | 440 => DisconnectDecision::Permanent { logged_out: true },
            // Concurrent-login conflict settles; retry after backoff.
            409 => DisconnectDecision::Reconnect {
                delay: self.compute_backoff(attempts),
            },
            // Stream restart after pairing.
            515 => {
                if self.settings.enable_515_flow {
                    DisconnectDecision::Reinitialize
                } else {
                    DisconnectDecision::Reconnect {
                        delay: self.compute_backoff(attempts),
                    }
                }
            }
            // Timeouts and connection drops.
            408 | 428 => DisconnectDecision::Reconnect {
                delay: self.compute_backoff(attempts),
            },
            // Remaining client errors will not fix themselves.
            code if (400..500).contains(&code) => {
                tracing::warn!(code, message = reason.message, "permanent disconnect");
                DisconnectDecision::Permanent { logged_out: false }
            }
            // Server-side trouble and everything else: transient.
            _ => DisconnectDecision::Reconnect {
                delay: self.compute_backoff(attempts),
            },
        }
    }

    /// Exponential backoff with full jitter over the upper half.
    pub fn compute_backoff(&self, attempts: u32) -> Duration {
        let exp = self
            .settings
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempts.min(16)));
        let capped = exp.min(self.settings.backoff_cap);
        let half = capped / 2;
        let jitter_ms = if half.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=half.as_millis() as u64)
        };
        half + Duration::from_millis(jitter_ms)
    }

    /// Tear down sockets that never reach open within the deadline.
    fn spawn_connect_watchdog(
        &self,
        driver: Arc<dyn SocketDriver>,
        session_id: &str,
        cancel: CancellationToken,
    ) {
        let deadline = self.settings.connect_timeout;
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(deadline) => {
                    if driver.transport_state() != TransportState::Open {
                        tracing::warn!(session_id, "connection deadline expired, tearing down");
                        driver.close().await;
                    }
                }
                () = cancel.cancelled() => {}
            }
        });
    }

    /// Track the pairing attempt and request a code once the transport is up.
    fn schedule_pairing(
        self: &Arc<Self>,
        session_id: &str,
        phone: String,
        driver: Arc<dyn SocketDriver>,
        auth: AuthHandle,
        code_slot: Arc<StdMutex<Option<String>>>,
        cancel: CancellationToken,
    ) {
        {
            let mut in_flight = self.pairing_in_flight.lock().unwrap();
            if !in_flight.insert(session_id.to_string()) {
                tracing::debug!(session_id, "pairing already scheduled");
                return;
            }
        }
        auth.mark_pairing(true);

        let manager = Arc::clone(self);
        let session_id = session_id.to_string();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            tokio::select! {
                outcome = run_pairing(&settings, driver, &phone, &code_slot) => {
                    match outcome {
                        Ok(()) => tracing::info!(session_id, "pairing code issued"),
                        Err(e) => {
                            tracing::warn!(session_id, error = %e, "pairing did not complete");
                        }
                    }
                }
                () = cancel.cancelled() => {
                    tracing::debug!(session_id, "pairing cancelled");
                }
            }

            // Long grace before the session may pair again; also the point
            // where the creds-validation exemption ends.
            tokio::select! {
                () = tokio::time::sleep(settings.pairing_grace) => {}
                () = cancel.cancelled() => {}
            }
            auth.mark_pairing(false);
            manager
                .pairing_in_flight
                .lock()
                .unwrap()
                .remove(&session_id);
        });
    }
}

/// Internal pairing outcome errors.
#[derive(Debug, Error)]
enum PairingRunError {
    #[error("transport never became ready")]
    TransportTimeout,
    #[error("pairing code request failed: {0}")]
    Request(DriverError),
}

/// Wait for the transport, then request the pairing code.
async fn run_pairing(
    settings: &ConnectSettings,
    driver: Arc<dyn SocketDriver>,
    phone: &str,
    code_slot: &Arc<StdMutex<Option<String>>>,
) -> Result<(), PairingRunError> {
    let deadline = tokio::time::Instant::now() + settings.pairing_wait_timeout;
    loop {
        match driver.transport_state() {
            TransportState::Connecting | TransportState::Open => break,
            TransportState::Closed => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(PairingRunError::TransportTimeout);
                }
                tokio::time::sleep(settings.pairing_poll_interval).await;
            }
        }
    }

    match driver.request_pairing_code(phone).await {
        Ok(code) => {
            *code_slot.lock().unwrap() = Some(code);
            Ok(())
        }
        Err(e) => Err(PairingRunError::Request(e)),
    }
}

/// Feed `creds.update` into the auth handle and everything else into the
/// message index, in emission order, until cancelled.
fn spawn_auth_subscriber(
    driver: Arc<dyn SocketDriver>,
    auth: AuthHandle,
    message_store: Arc<MessageStore>,
    cancel: CancellationToken,
) {
    let mut events = driver.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                () = cancel.cancelled() => return,
            };
            match event {
                Ok(DriverEvent::CredsUpdate { creds }) => {
                    if let Err(e) = auth.save_creds(&creds).await {
                        tracing::warn!(
                            session_id = auth.session_id(),
                            error = %e,
                            "creds persist failed"
                        );
                    }
                }
                Ok(other) => message_store.observe(&other),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "auth subscriber lagged behind event stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
