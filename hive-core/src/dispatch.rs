//! Inbound message dispatch.
//!
//! One dispatcher serves the whole fleet. Each inbound message runs two
//! paths: the anti-plugin scan (every message, deduplicated across sessions
//! through the ledger) and the command pipeline (prefix-addressed messages
//! only: resolve → enrich → mode gate → group-only gate → cached permission
//! check → dedup-aware execution).

pub mod permission;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dedup::{DedupKey, DedupLedger};
use crate::driver::{
    DriverEvent, InboundMessage, MessageContent, SendOptions, SocketDriver, UpsertKind,
    is_group_jid, jid_phone,
};
use crate::group_cache::{GroupCache, is_admin};
use crate::outbound::Outbound;
use crate::plugin::{
    CommandContext, Plugin, PluginCategory, PluginDescriptor, PluginHost, ScanContext,
};
use crate::store::{BotMode, SessionStore};
use permission::{Decision, PermissionCache, PermissionInput};

/// Dedup action for user-facing permission errors.
const ACTION_COMMAND_ERROR: &str = "command-error";

/// Dedup action for database-mutating command application.
const ACTION_DB_UPDATE: &str = "db-update";

/// Groupmenu commands retry database failures this many extra times.
const DB_RETRY_LIMIT: u32 = 2;

/// Sweep cadence for dispatcher temp state.
const TEMP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Contact-name cache entry lifetime.
const CONTACT_TTL: Duration = Duration::from_secs(300);

/// Identity of the session a message arrived on.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Session id.
    pub session_id: String,
    /// Owning user id.
    pub user_id: String,
}

/// The fleet-wide dispatcher.
pub struct Dispatcher {
    host: Arc<PluginHost>,
    ledger: Arc<DedupLedger>,
    groups: Arc<GroupCache>,
    store: Arc<dyn SessionStore>,
    outbound: Arc<Outbound>,
    permissions: PermissionCache,
    prefix: String,
    /// Push-name cache fed by `contacts.update`; swept periodically.
    contact_names: Mutex<HashMap<String, (String, Instant)>>,
}

impl Dispatcher {
    /// Build a dispatcher over the shared subsystems.
    pub fn new(
        host: Arc<PluginHost>,
        ledger: Arc<DedupLedger>,
        groups: Arc<GroupCache>,
        store: Arc<dyn SessionStore>,
        outbound: Arc<Outbound>,
        prefix: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            ledger,
            groups,
            store,
            outbound,
            permissions: PermissionCache::new(),
            prefix: prefix.into(),
            contact_names: Mutex::new(HashMap::new()),
        })
    }

    /// The configured command prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Route one driver event for one session.
    pub async fn handle_event(
        &self,
        session: &SessionContext,
        driver: &Arc<dyn SocketDriver>,
        event: &DriverEvent,
    ) {
        match event {
            DriverEvent::MessagesUpsert { messages, kind } => {
                if *kind != UpsertKind::Notify {
                    return;
                }
                for message in messages {
                    self.handle_message(session, driver, message).await;
                }
            }
            DriverEvent::ContactsUpdate { contacts } => {
                let mut names = self.contact_names.lock().unwrap();
                for contact in contacts {
                    if let Some(name) = &contact.notify {
                        names.insert(contact.id.clone(), (name.clone(), Instant::now()));
                    }
                }
            }
            DriverEvent::Call { from, id } => {
                tracing::debug!(session_id = session.session_id, from, call_id = id, "ignoring call");
            }
            _ => {}
        }
    }

    /// Run both dispatch paths for one inbound message.
    pub async fn handle_message(
        &self,
        session: &SessionContext,
        driver: &Arc<dyn SocketDriver>,
        message: &InboundMessage,
    ) {
        if !message.key.from_me {
            self.run_anti_plugins(session, driver, message).await;
        }
        self.run_command(session, driver, message).await;
    }

    /// Known push-name for a contact, if the cache holds one.
    pub fn contact_name(&self, jid: &str) -> Option<String> {
        self.contact_names
            .lock()
            .unwrap()
            .get(jid)
            .map(|(name, _)| name.clone())
    }

    /// Drop aged temp state. Returns removed entry count.
    pub fn sweep_temp_state(&self) -> usize {
        let mut names = self.contact_names.lock().unwrap();
        let before = names.len();
        names.retain(|_, (_, at)| at.elapsed() < CONTACT_TTL);
        before - names.len()
    }

    /// Run the 30 s temp-state sweep until cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TEMP_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.sweep_temp_state();
                    }
                    () = cancel.cancelled() => return,
                }
            }
        });
    }

    /// The anti-plugin scan: every scanning plugin gets one shot per message
    /// across the whole fleet.
    async fn run_anti_plugins(
        &self,
        session: &SessionContext,
        driver: &Arc<dyn SocketDriver>,
        message: &InboundMessage,
    ) {
        let key = DedupKey::new(&message.key.chat_id, &message.key.id);
        for (descriptor, plugin) in self.host.anti_plugins() {
            if !plugin.is_enabled(&message.key.chat_id) {
                continue;
            }
            if !plugin.should_process(message) {
                continue;
            }

            let action = format!("anti-{}", descriptor.id);
            if !self.ledger.try_lock(&key, &session.session_id, &action) {
                tracing::trace!(
                    session_id = session.session_id,
                    plugin = descriptor.id,
                    message_id = message.key.id,
                    "scan already owned elsewhere"
                );
                continue;
            }

            let ctx = ScanContext {
                session_id: session.session_id.clone(),
                chat_id: message.key.chat_id.clone(),
                is_group: is_group_jid(&message.key.chat_id),
                message: message.clone(),
                driver: Arc::clone(driver),
                outbound: Arc::clone(&self.outbound),
            };

            match plugin.process_message(&ctx).await {
                Ok(()) => self.ledger.mark_done(&key, &session.session_id, &action),
                Err(e) => {
                    // Isolated: a failing scan never takes the session down.
                    // The unexpired lock blocks rescans until it ages out.
                    tracing::warn!(
                        plugin = descriptor.id,
                        message_id = message.key.id,
                        error = %e,
                        "anti-plugin failed"
                    );
                }
            }
        }
    }

    /// The command pipeline.
    async fn run_command(
        &self,
        session: &SessionContext,
        driver: &Arc<dyn SocketDriver>,
        message: &InboundMessage,
    ) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        let Some(rest) = text.strip_prefix(&self.prefix) else {
            return;
        };
        let mut parts = rest.split_whitespace();
        let Some(command) = parts.next() else {
            return;
        };
        let args: Vec<String> = parts.map(str::to_string).collect();

        // 1. Resolve; unknown commands drop silently.
        let Some((descriptor, handler)) = self.host.resolve(command) else {
            return;
        };

        // 2. Enriched context inputs.
        let chat_id = message.key.chat_id.clone();
        let is_group = is_group_jid(&chat_id);
        let sender_id = message.sender_id().to_string();
        let bot_phone = driver
            .user()
            .map(|u| u.phone_number().to_string())
            .unwrap_or_default();
        let is_creator = !bot_phone.is_empty()
            && (message.key.from_me || jid_phone(&sender_id) == bot_phone);

        let settings = match self.store.get_user_settings(&session.user_id).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(user_id = session.user_id, error = %e, "settings lookup failed");
                Default::default()
            }
        };

        // 3. Bot mode gate.
        if settings.bot_mode == BotMode::SelfOnly && !is_creator {
            return;
        }

        // 4. Group-only gate.
        if is_group && !settings.group_only && descriptor.category != PluginCategory::Mode {
            let sender_is_admin = self.sender_is_admin(driver, &chat_id, &sender_id).await;
            if is_creator || sender_is_admin {
                let _ = self
                    .outbound
                    .send(
                        driver.as_ref(),
                        &chat_id,
                        MessageContent::text("Group commands are currently disabled."),
                        SendOptions::default(),
                    )
                    .await;
            }
            return;
        }

        // 5. Permission check, cached.
        let decision = self
            .permission_decision(
                driver,
                &descriptor,
                &chat_id,
                &sender_id,
                is_group,
                is_creator,
                settings.is_vip,
            )
            .await;

        match decision {
            Decision::Allow => {}
            Decision::DenySilent => return,
            Decision::Deny { message: reply } => {
                self.deliver_deny_reply(session, driver, &descriptor, message, &reply)
                    .await;
                return;
            }
        }

        // 6. Cross-session dedup for database-mutating commands. The winner
        // marks done before executing so a slow handler cannot open a window
        // for a second session to re-apply.
        let key = DedupKey::new(&message.key.chat_id, &message.key.id);
        if descriptor.db_update {
            if !self
                .ledger
                .try_lock(&key, &session.session_id, ACTION_DB_UPDATE)
            {
                tracing::debug!(
                    session_id = session.session_id,
                    command,
                    "db-update already applied elsewhere"
                );
                return;
            }
            self.ledger
                .mark_done(&key, &session.session_id, ACTION_DB_UPDATE);
        }

        // 7. Execute, with the groupmenu database-retry policy.
        let ctx = CommandContext {
            session_id: session.session_id.clone(),
            chat_id,
            sender_id,
            is_group,
            is_creator,
            command: command.to_ascii_lowercase(),
            args,
            message: message.clone(),
            category: descriptor.category,
            driver: Arc::clone(driver),
            outbound: Arc::clone(&self.outbound),
        };

        if let Err(e) = self.execute_with_retry(&descriptor, handler.as_ref(), &ctx).await {
            tracing::warn!(
                session_id = session.session_id,
                plugin = descriptor.id,
                command = ctx.command,
                error = %e,
                "command failed"
            );
        }
    }

    async fn execute_with_retry(
        &self,
        descriptor: &PluginDescriptor,
        handler: &dyn Plugin,
        ctx: &CommandContext,
    ) -> Result<(), crate::plugin::PluginError> {
        let retries = if descriptor.category == PluginCategory::GroupMenu {
            DB_RETRY_LIMIT
        } else {
            0
        };

        let mut attempt = 0u32;
        loop {
            match handler.execute(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_database_error() && attempt < retries => {
                    attempt += 1;
                    tracing::debug!(
                        plugin = descriptor.id,
                        attempt,
                        error = %e,
                        "database error, retrying command"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a permission-denied reply. For groupmenu and gamemenu the reply
    /// is routed through the ledger so only the first session answers.
    async fn deliver_deny_reply(
        &self,
        session: &SessionContext,
        driver: &Arc<dyn SocketDriver>,
        descriptor: &PluginDescriptor,
        message: &InboundMessage,
        reply: &str,
    ) {
        let deduplicated = matches!(
            descriptor.category,
            PluginCategory::GroupMenu | PluginCategory::GameMenu
        );

        if deduplicated {
            let key = DedupKey::new(&message.key.chat_id, &message.key.id);
            if !self
                .ledger
                .try_lock(&key, &session.session_id, ACTION_COMMAND_ERROR)
            {
                return;
            }
            let sent = self
                .outbound
                .send(
                    driver.as_ref(),
                    &message.key.chat_id,
                    MessageContent::text(reply),
                    SendOptions::default(),
                )
                .await;
            if sent.is_ok() {
                self.ledger
                    .mark_done(&key, &session.session_id, ACTION_COMMAND_ERROR);
            }
        } else {
            let _ = self
                .outbound
                .send(
                    driver.as_ref(),
                    &message.key.chat_id,
                    MessageContent::text(reply),
                    SendOptions::default(),
                )
                .await;
        }
    }

    async fn permission_decision(
        &self,
        driver: &Arc<dyn SocketDriver>,
        descriptor: &PluginDescriptor,
        chat_id: &str,
        sender_id: &str,
        is_group: bool,
        is_creator: bool,
        is_vip: bool,
    ) -> Decision {
        if let Some(cached) = self.permissions.get(&descriptor.id, sender_id, chat_id) {
            return cached;
        }

        let is_group_admin = if is_group {
            self.sender_is_admin(driver, chat_id, sender_id).await
        } else {
            false
        };

        let decision = permission::check(&PermissionInput {
            descriptor,
            is_group,
            is_creator,
            is_group_admin,
            is_vip,
        });
        self.permissions
            .put(&descriptor.id, sender_id, chat_id, decision.clone());
        decision
    }

    async fn sender_is_admin(
        &self,
        driver: &Arc<dyn SocketDriver>,
        chat_id: &str,
        sender_id: &str,
    ) -> bool {
        match self.groups.get(driver.as_ref(), chat_id, false).await {
            Ok(Some(meta)) => is_admin(&meta, sender_id),
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(chat_id, error = %e, "admin lookup failed");
                false
            }
        }
    }
}
