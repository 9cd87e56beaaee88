//! Hive core library.
//!
//! A multi-tenant WhatsApp bot runtime: one process hosts many independent
//! client sessions, dispatches inbound messages through a pluggable command
//! and anti-abuse engine, and keeps every session healthy across restarts.
//! The encrypted transport itself is an external collaborator behind the
//! [`driver::SocketDriver`] contract.

pub mod auth;
pub mod channel_join;
pub mod config;
pub mod connection;
pub mod control;
pub mod dedup;
pub mod dispatch;
pub mod driver;
pub mod group_cache;
pub mod manager;
pub mod message_store;
pub mod outbound;
pub mod plugin;
pub mod rate_bucket;
pub mod session;
pub mod store;

pub use auth::{AuthError, AuthHandle, AuthStore};
pub use channel_join::ChannelJoiner;
pub use config::{Config, ConfigError, StorageMode};
pub use connection::{ConnectError, ConnectSettings, ConnectionManager, DisconnectDecision};
pub use control::{ControlEvent, ControlNotifier, NoopNotifier};
pub use dedup::{DedupKey, DedupLedger};
pub use dispatch::{Dispatcher, SessionContext};
pub use driver::{DriverError, DriverEvent, DriverFactory, SocketDriver};
pub use group_cache::GroupCache;
pub use manager::{ManagerError, ManagerSettings, ManagerStats, SessionManager};
pub use message_store::MessageStore;
pub use outbound::Outbound;
pub use plugin::{Plugin, PluginHost};
pub use rate_bucket::RateBucket;
pub use session::{ConnectionStatus, SessionRecord, SessionSource, session_id_for};
pub use store::{SessionStore, StoreError, create_session_store};
