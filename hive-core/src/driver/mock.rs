//! Scripted in-memory SocketDriver.
//!
//! Used by every driver-facing test and selectable as the `mock` driver
//! kind. Behaviors are scripted through builder-style setters: queued send
//! results, per-group metadata results, pairing codes, connect outcomes.
//! Unscripted calls fall back to benign defaults so simple tests stay short.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;

use super::*;
use crate::auth::AuthHandle;

/// One observed send attempt.
#[derive(Debug, Clone)]
pub struct SendRecord {
    /// Target jid.
    pub jid: String,
    /// Payload as handed to the driver.
    pub content: MessageContent,
    /// Options as handed to the driver.
    pub options: SendOptions,
    /// Outcome of the attempt.
    pub result: Result<(), DriverError>,
    /// When the attempt started.
    pub at: tokio::time::Instant,
}

/// Scripted driver.
pub struct MockDriver {
    user: Mutex<Option<DriverUser>>,
    user_on_connect: Mutex<Option<DriverUser>>,
    transport: Mutex<TransportState>,
    events_tx: broadcast::Sender<DriverEvent>,
    lookup: Mutex<Option<MessageLookup>>,

    send_results: Mutex<VecDeque<Result<(), DriverError>>>,
    send_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<SendRecord>>,

    groups: Mutex<HashMap<String, GroupMetadata>>,
    group_results: Mutex<HashMap<String, VecDeque<Result<GroupMetadata, DriverError>>>>,
    group_fetches: AtomicUsize,

    connect_results: Mutex<VecDeque<Result<(), DriverError>>>,
    auto_open_on_connect: AtomicBool,

    pairing_codes: Mutex<VecDeque<Result<String, DriverError>>>,
    pairing_requests: Mutex<Vec<String>>,

    buffered: Mutex<Vec<DriverEvent>>,
    flush_count: AtomicUsize,

    followed: Mutex<Vec<String>>,
    pinned: Mutex<Vec<(String, bool)>>,
    on_whatsapp_exists: AtomicBool,
    logged_out: AtomicBool,
    close_count: AtomicUsize,
}

impl MockDriver {
    /// Fresh driver: closed transport, no identity, everything unscripted.
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            user: Mutex::new(None),
            user_on_connect: Mutex::new(None),
            transport: Mutex::new(TransportState::Closed),
            events_tx,
            lookup: Mutex::new(None),
            send_results: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
            group_results: Mutex::new(HashMap::new()),
            group_fetches: AtomicUsize::new(0),
            connect_results: Mutex::new(VecDeque::new()),
            auto_open_on_connect: AtomicBool::new(true),
            pairing_codes: Mutex::new(VecDeque::new()),
            pairing_requests: Mutex::new(Vec::new()),
            buffered: Mutex::new(Vec::new()),
            flush_count: AtomicUsize::new(0),
            followed: Mutex::new(Vec::new()),
            pinned: Mutex::new(Vec::new()),
            on_whatsapp_exists: AtomicBool::new(true),
            logged_out: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        })
    }

    /// Set the identity that appears once the transport opens.
    pub fn with_user(self: Arc<Self>, jid: impl Into<String>) -> Arc<Self> {
        let user = DriverUser { id: jid.into() };
        *self.user_on_connect.lock().unwrap() = Some(user);
        self
    }

    /// Set the identity immediately (already-connected driver).
    pub fn set_user(&self, jid: impl Into<String>) {
        let user = DriverUser { id: jid.into() };
        *self.user_on_connect.lock().unwrap() = Some(user.clone());
        *self.user.lock().unwrap() = Some(user);
    }

    /// Force the transport state.
    pub fn set_transport(&self, state: TransportState) {
        *self.transport.lock().unwrap() = state;
    }

    /// Queue the outcome of the next unscripted send. Defaults to success.
    pub fn script_send(&self, result: Result<(), DriverError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    /// Every send waits this long first (drives timeout tests).
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock().unwrap() = delay;
    }

    /// Register fixed group metadata returned for unscripted fetches.
    pub fn set_group(&self, meta: GroupMetadata) {
        self.groups.lock().unwrap().insert(meta.id.clone(), meta);
    }

    /// Queue one fetch outcome for a group, consumed before the fixed map.
    pub fn script_group_result(&self, jid: &str, result: Result<GroupMetadata, DriverError>) {
        self.group_results
            .lock()
            .unwrap()
            .entry(jid.to_string())
            .or_default()
            .push_back(result);
    }

    /// Queue the outcome of the next connect. Defaults to success.
    pub fn script_connect(&self, result: Result<(), DriverError>) {
        self.connect_results.lock().unwrap().push_back(result);
    }

    /// Whether a successful connect opens the transport and emits events.
    pub fn set_auto_open(&self, auto: bool) {
        self.auto_open_on_connect.store(auto, Ordering::SeqCst);
    }

    /// Queue a pairing-code outcome. Defaults to `Ok("HIVE-CODE")`.
    pub fn script_pairing(&self, result: Result<String, DriverError>) {
        self.pairing_codes.lock().unwrap().push_back(result);
    }

    /// Stage an event for release by `flush_buffered_events`.
    pub fn buffer_event(&self, event: DriverEvent) {
        self.buffered.lock().unwrap().push(event);
    }

    /// Emit an event to all subscribers immediately.
    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Scripted registration-check answer for `on_whatsapp`.
    pub fn set_on_whatsapp_exists(&self, exists: bool) {
        self.on_whatsapp_exists.store(exists, Ordering::SeqCst);
    }

    /// All send attempts so far.
    pub fn sent(&self) -> Vec<SendRecord> {
        self.sent.lock().unwrap().clone()
    }

    /// Successful send attempts only.
    pub fn delivered(&self) -> Vec<SendRecord> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.result.is_ok())
            .cloned()
            .collect()
    }

    /// Newsletter jids followed so far.
    pub fn followed(&self) -> Vec<String> {
        self.followed.lock().unwrap().clone()
    }

    /// Phones that requested pairing codes.
    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().unwrap().clone()
    }

    /// How many times buffered events were flushed.
    pub fn flush_count(&self) -> usize {
        self.flush_count.load(Ordering::SeqCst)
    }

    /// How many raw metadata fetches reached the driver.
    pub fn group_fetches(&self) -> usize {
        self.group_fetches.load(Ordering::SeqCst)
    }

    /// Whether `logout` was called.
    pub fn logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }

    /// How many times `close` was called.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// The installed message lookup, if any.
    pub fn message_lookup(&self) -> Option<MessageLookup> {
        self.lookup.lock().unwrap().clone()
    }
}

#[async_trait]
impl SocketDriver for MockDriver {
    fn user(&self) -> Option<DriverUser> {
        self.user.lock().unwrap().clone()
    }

    fn transport_state(&self) -> TransportState {
        *self.transport.lock().unwrap()
    }

    fn subscribe(&self) -> broadcast::Receiver<DriverEvent> {
        self.events_tx.subscribe()
    }

    fn set_message_lookup(&self, lookup: MessageLookup) {
        *self.lookup.lock().unwrap() = Some(lookup);
    }

    async fn connect(&self) -> Result<(), DriverError> {
        let scripted = self.connect_results.lock().unwrap().pop_front();
        match scripted.unwrap_or(Ok(())) {
            Ok(()) => {
                if self.auto_open_on_connect.load(Ordering::SeqCst) {
                    self.set_transport(TransportState::Connecting);
                    self.emit(DriverEvent::ConnectionUpdate {
                        state: ConnectionState::Connecting,
                        reason: None,
                    });
                    let identity = self.user_on_connect.lock().unwrap().clone().or_else(|| {
                        // Unscripted drivers still present an identity once
                        // the transport opens.
                        Some(DriverUser {
                            id: "10000000000:1@s.whatsapp.net".to_string(),
                        })
                    });
                    *self.user.lock().unwrap() = identity;
                    self.set_transport(TransportState::Open);
                    self.emit(DriverEvent::ConnectionUpdate {
                        state: ConnectionState::Open,
                        reason: None,
                    });
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn send_message(
        &self,
        jid: &str,
        content: MessageContent,
        options: SendOptions,
    ) -> Result<SentMessage, DriverError> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));

        self.sent.lock().unwrap().push(SendRecord {
            jid: jid.to_string(),
            content,
            options,
            result: result.clone(),
            at: tokio::time::Instant::now(),
        });

        result.map(|()| SentMessage {
            key: MessageKey {
                chat_id: jid.to_string(),
                id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
                from_me: true,
                participant: None,
            },
            timestamp: Utc::now(),
        })
    }

    async fn group_metadata(&self, jid: &str) -> Result<GroupMetadata, DriverError> {
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .group_results
            .lock()
            .unwrap()
            .get_mut(jid)
            .and_then(VecDeque::pop_front);
        if let Some(result) = scripted {
            return result;
        }
        self.groups
            .lock()
            .unwrap()
            .get(jid)
            .cloned()
            .ok_or_else(|| DriverError::Forbidden("unknown group".to_string()))
    }

    async fn on_whatsapp(&self, phone: &str) -> Result<Vec<NumberCheck>, DriverError> {
        Ok(vec![NumberCheck {
            jid: phone_to_jid(phone),
            exists: self.on_whatsapp_exists.load(Ordering::SeqCst),
        }])
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String, DriverError> {
        self.pairing_requests.lock().unwrap().push(phone.to_string());
        self.pairing_codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("HIVE-CODE".to_string()))
    }

    async fn newsletter_follow(&self, jid: &str) -> Result<(), DriverError> {
        self.followed.lock().unwrap().push(jid.to_string());
        Ok(())
    }

    async fn newsletter_unmute(&self, _jid: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn subscribe_newsletter_updates(&self, _jid: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn newsletter_metadata(&self, jid: &str) -> Result<NewsletterMetadata, DriverError> {
        Ok(NewsletterMetadata {
            id: jid.to_string(),
            name: "Mock Channel".to_string(),
            following: self.followed.lock().unwrap().iter().any(|j| j == jid),
        })
    }

    async fn chat_modify_pin(&self, jid: &str, pinned: bool) -> Result<(), DriverError> {
        self.pinned.lock().unwrap().push((jid.to_string(), pinned));
        Ok(())
    }

    async fn flush_buffered_events(&self) {
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        let staged: Vec<DriverEvent> = self.buffered.lock().unwrap().drain(..).collect();
        for event in staged {
            self.emit(event);
        }
    }

    async fn logout(&self) -> Result<(), DriverError> {
        self.logged_out.store(true, Ordering::SeqCst);
        self.set_transport(TransportState::Closed);
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.set_transport(TransportState::Closed);
    }
}

/// Factory handing out mock drivers.
///
/// Tests can pre-stage specific driver instances; unstaged creates produce a
/// default auto-opening driver. Every created driver and auth handle is
/// recorded for assertions.
#[derive(Default)]
pub struct MockDriverFactory {
    staged: Mutex<VecDeque<Arc<MockDriver>>>,
    failures: Mutex<VecDeque<DriverError>>,
    created: Mutex<Vec<(String, Arc<MockDriver>)>>,
    auth_handles: Mutex<Vec<AuthHandle>>,
}

impl MockDriverFactory {
    /// Fresh factory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a specific driver for the next create.
    pub fn stage(&self, driver: Arc<MockDriver>) {
        self.staged.lock().unwrap().push_back(driver);
    }

    /// Make the next create fail.
    pub fn fail_next(&self, error: DriverError) {
        self.failures.lock().unwrap().push_back(error);
    }

    /// Drivers created so far, with their session ids.
    pub fn created(&self) -> Vec<(String, Arc<MockDriver>)> {
        self.created.lock().unwrap().clone()
    }

    /// The most recently created driver.
    pub fn last_created(&self) -> Option<Arc<MockDriver>> {
        self.created.lock().unwrap().last().map(|(_, d)| Arc::clone(d))
    }

    /// Auth handles the factory was invoked with.
    pub fn auth_handles(&self) -> Vec<AuthHandle> {
        self.auth_handles.lock().unwrap().clone()
    }
}

#[async_trait]
impl DriverFactory for MockDriverFactory {
    async fn create(
        &self,
        session_id: &str,
        auth: AuthHandle,
    ) -> Result<Arc<dyn SocketDriver>, DriverError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let driver = self
            .staged
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MockDriver::new);
        self.created
            .lock()
            .unwrap()
            .push((session_id.to_string(), Arc::clone(&driver)));
        self.auth_handles.lock().unwrap().push(auth);
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_opens_and_emits() {
        let driver = MockDriver::new().with_user("15550001111:1@s.whatsapp.net");
        let mut events = driver.subscribe();

        driver.connect().await.unwrap();

        assert_eq!(driver.transport_state(), TransportState::Open);
        assert_eq!(driver.user().unwrap().phone_number(), "15550001111");
        assert!(matches!(
            events.recv().await.unwrap(),
            DriverEvent::ConnectionUpdate { state: ConnectionState::Connecting, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            DriverEvent::ConnectionUpdate { state: ConnectionState::Open, .. }
        ));
    }

    #[tokio::test]
    async fn test_scripted_send_results_consumed_in_order() {
        let driver = MockDriver::new();
        driver.script_send(Err(DriverError::Timeout));
        driver.script_send(Ok(()));

        let err = driver
            .send_message("a@s.whatsapp.net", MessageContent::text("x"), SendOptions::default())
            .await;
        assert_eq!(err.unwrap_err(), DriverError::Timeout);

        let ok = driver
            .send_message("a@s.whatsapp.net", MessageContent::text("y"), SendOptions::default())
            .await;
        assert!(ok.is_ok());
        assert_eq!(driver.sent().len(), 2);
        assert_eq!(driver.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_group_results_before_fixed_map() {
        let driver = MockDriver::new();
        let meta = GroupMetadata {
            id: "g@g.us".to_string(),
            subject: "Fixed".to_string(),
            participants: Vec::new(),
            announce: false,
            restrict: false,
        };
        driver.set_group(meta.clone());
        driver.script_group_result("g@g.us", Err(DriverError::RateLimited));

        assert_eq!(
            driver.group_metadata("g@g.us").await.unwrap_err(),
            DriverError::RateLimited
        );
        assert_eq!(driver.group_metadata("g@g.us").await.unwrap(), meta);
        assert_eq!(driver.group_fetches(), 2);
    }

    #[tokio::test]
    async fn test_unknown_group_is_forbidden() {
        let driver = MockDriver::new();
        assert!(matches!(
            driver.group_metadata("nope@g.us").await,
            Err(DriverError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_flush_releases_buffered_events() {
        let driver = MockDriver::new();
        driver.buffer_event(DriverEvent::Call {
            from: "x@s.whatsapp.net".to_string(),
            id: "c1".to_string(),
        });
        let mut events = driver.subscribe();

        driver.flush_buffered_events().await;

        assert!(matches!(events.recv().await.unwrap(), DriverEvent::Call { .. }));
        assert_eq!(driver.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_factory_staging_and_failure() {
        let factory = MockDriverFactory::new();
        let staged = MockDriver::new();
        factory.stage(Arc::clone(&staged));
        factory.fail_next(DriverError::Transport("boom".to_string()));

        // Failure is consumed first.
        let dir = tempfile::TempDir::new().unwrap();
        let store = crate::auth::AuthStore::new(
            dir.path(),
            crate::config::StorageMode::File,
            None,
            tokio_util::sync::CancellationToken::new(),
        );
        let auth = store.open("session_f").await.unwrap();

        let err = factory.create("session_f", auth.clone()).await;
        assert!(err.is_err());

        let created = factory.create("session_f", auth).await.unwrap();
        assert_eq!(created.transport_state(), staged.transport_state());
        assert_eq!(factory.created().len(), 1);
        assert_eq!(factory.auth_handles().len(), 1);
    }
}
