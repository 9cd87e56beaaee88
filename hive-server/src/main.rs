//! Hive server — multi-tenant WhatsApp bot runtime.
//!
//! Wires the core subsystems together: configuration, tracing, the
//! dual-tier auth store, session metadata storage, the plugin host with
//! optional hot reload, the session manager, and the admin HTTP surface.

mod http;
mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;

use hive_core::auth::AuthStore;
use hive_core::auth::secondary::{MongoSecondaryStore, SecondaryStore};
use hive_core::channel_join::ChannelJoiner;
use hive_core::config::{Config, ConfigError, StorageMode};
use hive_core::connection::{ConnectSettings, ConnectionManager};
use hive_core::dedup::DedupLedger;
use hive_core::driver::DriverFactory;
use hive_core::driver::mock::MockDriverFactory;
use hive_core::group_cache::GroupCache;
use hive_core::plugin::builtin::register_builtin_handlers;
use hive_core::plugin::watcher::PluginWatcher;
use hive_core::plugin::PluginHost;
use hive_core::rate_bucket::RateBucket;
use hive_core::store::{SessionStore, create_session_store};
use hive_core::{
    ControlNotifier, Dispatcher, ManagerSettings, NoopNotifier, Outbound, SessionManager,
};

use http::AppState;
use rate_limit::ApiLimits;

/// Hive server — WhatsApp bot fleet host
#[derive(Parser)]
#[command(name = "hive-server")]
struct Args {
    /// Path to a custom config file (overrides default search locations)
    #[arg(short = 'c', long)]
    config: Option<std::path::PathBuf>,
}

/// Default tracing directives enabling info-level logs for this crate and hive-core.
const DEFAULT_DIRECTIVES: &[&str] = &["hive_server=info", "hive_core=info"];

/// Build the `EnvFilter`: RUST_LOG (if set), our defaults, plus the driver
/// log-level directive that keeps the chatty transport quiet.
fn env_filter(config: &Config) -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    let driver_directive = format!("hive_core::driver={}", config.driver.log_level);
    filter = filter.add_directive(driver_directive.parse()?);
    Ok(filter)
}

/// Initialize the tracing subscriber.
///
/// When `config.logging` is `Some`, creates a layered subscriber with both
/// stdout and rolling file output. When `None`, uses stdout-only.
///
/// Returns the non-blocking writer guard that must be held for the process
/// lifetime.
fn init_tracing(
    config: &Config,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    if let Some(ref lc) = config.logging {
        if let Err(e) = std::fs::create_dir_all(&lc.directory) {
            eprintln!(
                "Warning: Failed to create log directory '{}': {}. Falling back to stdout-only.",
                lc.directory, e
            );
            tracing_subscriber::fmt().with_env_filter(env_filter(config)?).init();
            return Ok(None);
        }

        let rotation = match lc.rotation.as_str() {
            "daily" => tracing_appender::rolling::Rotation::DAILY,
            "hourly" => tracing_appender::rolling::Rotation::HOURLY,
            "never" => tracing_appender::rolling::Rotation::NEVER,
            other => {
                eprintln!("Warning: Unknown rotation '{}', falling back to daily", other);
                tracing_appender::rolling::Rotation::DAILY
            }
        };

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix("hive-server")
            .filename_suffix("log")
            .max_log_files(lc.max_files)
            .build(&lc.directory)
            .context("Failed to create rolling file appender")?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let stdout_layer = tracing_subscriber::fmt::layer();
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter(config)?)
            .with(stdout_layer)
            .with(file_layer)
            .init();

        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter(config)?).init();
        Ok(None)
    }
}

/// Resolve the configured driver factory.
fn create_driver_factory(config: &Config) -> Result<Arc<dyn DriverFactory>, ConfigError> {
    match config.driver.kind.as_str() {
        // The production transport is linked by the deployment; the bundled
        // kind is the scripted in-memory driver.
        "mock" => Ok(MockDriverFactory::new() as Arc<dyn DriverFactory>),
        unknown => Err(ConfigError::UnknownDriver(unknown.to_string())),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // 1. Configuration first; tracing setup depends on it.
    let config = Config::load(args.config.as_deref()).context("Failed to load config")?;
    let _guard = init_tracing(&config)?;
    tracing::info!("Starting Hive server");

    let cancel = CancellationToken::new();

    // 2. Secondary auth tier, when configured. A dead secondary never
    // prevents startup; the store just runs file-only.
    let secondary: Option<Arc<dyn SecondaryStore>> = match (
        config.storage.mode,
        config.storage.mongodb_uri.as_deref(),
    ) {
        (StorageMode::Mongodb, Some(uri)) => {
            match MongoSecondaryStore::connect(uri, &config.storage.mongodb_db).await {
                Ok(store) => Some(Arc::new(store) as Arc<dyn SecondaryStore>),
                Err(e) => {
                    tracing::error!(error = %e, "secondary store unreachable, continuing file-only");
                    None
                }
            }
        }
        (StorageMode::Mongodb, None) => {
            tracing::warn!("storage mode is mongodb but MONGODB_URI is unset");
            None
        }
        (StorageMode::File, _) => None,
    };

    // 3. Storage tiers.
    let auth_store = AuthStore::new(
        config.storage.base_dir.clone(),
        config.storage.mode,
        secondary,
        cancel.child_token(),
    );
    let session_store: Arc<dyn SessionStore> = Arc::from(
        create_session_store(&config.storage.database_url)
            .await
            .context("Failed to initialize session store")?,
    );

    // 4. Shared runtime pieces.
    let bucket = Arc::new(RateBucket::new());
    let outbound = Arc::new(Outbound::new(bucket));
    let groups = Arc::new(GroupCache::new());
    let ledger = DedupLedger::new();
    ledger.spawn_sweeper(cancel.child_token());

    // 5. Plugins: compiled handlers plus on-disk descriptors, hot reload
    // when enabled.
    let host = PluginHost::new();
    register_builtin_handlers(&host);
    match host.load_dir(&config.plugins.dir) {
        Ok(count) => tracing::info!(count, dir = %config.plugins.dir.display(), "plugins loaded"),
        Err(e) => tracing::warn!(error = %e, "plugin load failed, starting with none"),
    }
    if config.plugins.auto_reload && config.plugins.dir.is_dir() {
        let watcher = PluginWatcher::new(
            Arc::clone(&host),
            config.plugins.dir.clone(),
            Duration::from_millis(config.plugins.reload_debounce_ms),
        )
        .context("Failed to create plugin watcher")?;
        watcher
            .spawn(cancel.child_token())
            .context("Failed to start plugin watcher")?;
    }

    let dispatcher = Dispatcher::new(
        Arc::clone(&host),
        Arc::clone(&ledger),
        Arc::clone(&groups),
        Arc::clone(&session_store),
        Arc::clone(&outbound),
        config.runtime.command_prefix.clone(),
    );

    // 6. Connection and session management.
    let factory = create_driver_factory(&config)?;
    let connections = ConnectionManager::new(
        Arc::clone(&auth_store),
        factory,
        ConnectSettings {
            enable_515_flow: config.runtime.enable_515_flow,
            ..ConnectSettings::default()
        },
    );

    let joiner = config
        .runtime
        .channel_jid
        .as_deref()
        .map(ChannelJoiner::new);

    let manager = SessionManager::new(
        Arc::clone(&session_store),
        auth_store,
        connections,
        dispatcher,
        groups,
        outbound,
        Arc::new(NoopNotifier) as Arc<dyn ControlNotifier>,
        joiner,
        ManagerSettings::default(),
        cancel.clone(),
    );
    manager.start();

    // 7. Bring persisted sessions back.
    let restored = manager.restore_sessions().await;
    tracing::info!(restored, "session restore complete");

    // 8. Admin HTTP surface.
    let state = AppState {
        manager: Arc::clone(&manager),
        store: session_store,
        limits: Arc::new(ApiLimits::new()),
        started_at: std::time::Instant::now(),
    };
    let app = http::router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr, "admin API listening");

    let shutdown_manager = Arc::clone(&manager);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("HTTP server failed")?;

    // 9. Graceful teardown: close every socket, flush auth material.
    shutdown_manager.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
