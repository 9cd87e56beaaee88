//! Configuration management for Hive.
//!
//! Provides configuration loading from TOML files with support for
//! multiple file locations, environment variable overrides, and sensible defaults.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    Io {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as TOML.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Path to the configuration file that could not be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },

    /// An environment override carried a value the field cannot hold.
    #[error("invalid value '{value}' for {variable}")]
    InvalidOverride {
        /// The environment variable name.
        variable: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The configured driver kind is not registered.
    #[error("unknown driver kind: {0}")]
    UnknownDriver(String),
}

/// Application configuration loaded from a TOML file plus environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct Config {
    /// HTTP admin surface settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Auth material storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Runtime behavior knobs.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Plugin loading and hot-reload settings.
    #[serde(default)]
    pub plugins: PluginConfig,

    /// SocketDriver selection and log filtering.
    #[serde(default)]
    pub driver: DriverConfig,

    /// Optional rolling-file logging. `None` means stdout-only.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Port the admin API listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address for the admin API.
    #[serde(default = "default_bind")]
    pub bind: String,
}

/// Where auth blobs live and whether a secondary backup tier is active.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    /// `file` keeps auth material local only; `mongodb` adds the backup tier.
    #[serde(default = "default_storage_mode")]
    pub mode: StorageMode,

    /// Base directory for per-session auth directories.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// Session metadata database URL (sqlite).
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// MongoDB connection string for the secondary tier.
    #[serde(default)]
    pub mongodb_uri: Option<String>,

    /// MongoDB database name for the secondary tier.
    #[serde(default = "default_mongodb_db")]
    pub mongodb_db: String,
}

/// Storage topology selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Local files only; pre-key backups are suppressed while the secondary is unhealthy.
    File,
    /// Local files plus MongoDB backup for every record kind.
    Mongodb,
}

/// Runtime behavior knobs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuntimeConfig {
    /// Command prefix recognized by the dispatcher.
    #[serde(default = "default_prefix")]
    pub command_prefix: String,

    /// Newsletter jid every connected session joins, batched. Empty disables the hook.
    #[serde(default)]
    pub channel_jid: Option<String>,

    /// Re-create the session on a 515 stream-restart disconnect instead of
    /// a plain reconnect. Workaround knob, off by default.
    #[serde(default)]
    pub enable_515_flow: bool,
}

/// Plugin loading settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginConfig {
    /// Root directory of plugin descriptors, scanned recursively.
    #[serde(default = "default_plugin_dir")]
    pub dir: PathBuf,

    /// Watch the descriptor tree and hot-reload on change.
    #[serde(default = "default_auto_reload")]
    pub auto_reload: bool,

    /// Debounce window for descriptor reloads, in milliseconds.
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
}

/// SocketDriver selection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DriverConfig {
    /// Registered driver kind. The bundled kind is `mock`; production
    /// transports register their own.
    #[serde(default = "default_driver_kind")]
    pub kind: String,

    /// Log level directive applied to the driver's tracing target.
    #[serde(default = "default_driver_log_level")]
    pub log_level: String,
}

/// Rolling-file logging settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Directory for rolling log files.
    pub directory: String,

    /// Rotation cadence: `daily`, `hourly`, or `never`.
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Maximum number of rotated files to keep.
    #[serde(default = "default_max_files")]
    pub max_files: usize,
}

fn default_port() -> u16 {
    3000
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_storage_mode() -> StorageMode {
    StorageMode::File
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./sessions")
}

fn default_database_url() -> String {
    "sqlite:hive.db".to_string()
}

fn default_mongodb_db() -> String {
    "hive".to_string()
}

fn default_prefix() -> String {
    ".".to_string()
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_auto_reload() -> bool {
    true
}

fn default_reload_debounce_ms() -> u64 {
    1000
}

fn default_driver_kind() -> String {
    "mock".to_string()
}

fn default_driver_log_level() -> String {
    "warn".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: default_storage_mode(),
            base_dir: default_base_dir(),
            database_url: default_database_url(),
            mongodb_uri: None,
            mongodb_db: default_mongodb_db(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_prefix(),
            channel_jid: None,
            enable_515_flow: false,
        }
    }
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            auto_reload: default_auto_reload(),
            reload_debounce_ms: default_reload_debounce_ms(),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: default_driver_kind(),
            log_level: default_driver_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from the file system and apply environment overrides.
    ///
    /// Priority order for the file:
    /// 1. `path` argument, when given
    /// 2. `HIVE_CONFIG` environment variable
    /// 3. `./config.toml` (local directory)
    ///
    /// Returns default config if no config file is found. Environment
    /// overrides (`PORT`, `STORAGE_MODE`, `MONGODB_URI`,
    /// `WHATSAPP_CHANNEL_JID`, `ENABLE_515_FLOW`, `PLUGIN_AUTO_RELOAD`,
    /// `DRIVER_LOG_LEVEL`) are applied on top of whatever was loaded.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if a found file cannot be read,
    /// [`ConfigError::Parse`] if it is not valid TOML, and
    /// [`ConfigError::InvalidOverride`] for malformed environment values.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::load_from(p)?
        } else if let Ok(env_path) = std::env::var("HIVE_CONFIG") {
            let p = PathBuf::from(&env_path);
            if p.exists() {
                Self::load_from(p)?
            } else {
                Self::default()
            }
        } else {
            let local = PathBuf::from("config.toml");
            if local.exists() {
                Self::load_from(local)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    /// Returns [`ConfigError::Parse`] if the file is not valid TOML.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply the documented environment overrides in place.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = non_empty_var("PORT") {
            self.server.port =
                port.parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        variable: "PORT",
                        value: port,
                    })?;
        }

        if let Some(mode) = non_empty_var("STORAGE_MODE") {
            self.storage.mode = match mode.as_str() {
                "file" => StorageMode::File,
                "mongodb" => StorageMode::Mongodb,
                _ => {
                    return Err(ConfigError::InvalidOverride {
                        variable: "STORAGE_MODE",
                        value: mode,
                    });
                }
            };
        }

        if let Some(uri) = non_empty_var("MONGODB_URI") {
            self.storage.mongodb_uri = Some(uri);
        }

        if let Some(jid) = non_empty_var("WHATSAPP_CHANNEL_JID") {
            self.runtime.channel_jid = Some(jid);
        }

        if let Some(flag) = non_empty_var("ENABLE_515_FLOW") {
            self.runtime.enable_515_flow = parse_bool("ENABLE_515_FLOW", &flag)?;
        }

        if let Some(flag) = non_empty_var("PLUGIN_AUTO_RELOAD") {
            self.plugins.auto_reload = parse_bool("PLUGIN_AUTO_RELOAD", &flag)?;
        }

        if let Some(level) = non_empty_var("DRIVER_LOG_LEVEL") {
            self.driver.log_level = level;
        }

        Ok(())
    }
}

/// Read an environment variable, treating empty values as unset.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Parse a boolean override accepting the usual spellings.
fn parse_bool(variable: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidOverride {
            variable,
            value: value.to_string(),
        }),
    }
}
