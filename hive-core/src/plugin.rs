//! Plugin model: descriptors, handler registry, and the command index.
//!
//! A plugin is two halves. The hot-swappable half is an on-disk TOML
//! *descriptor* (`plugins/<category>/<id>.toml`) declaring commands,
//! aliases, category, and permission bits. The compiled half is a
//! [`Plugin`] handler registered by id at startup. The
//! [`PluginHost`] joins them: descriptors resolve to handlers through the
//! O(1) command index, which is rebuilt whole and swapped atomically on
//! every (re)load.

pub mod builtin;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::driver::{InboundMessage, MessageContent, SendOptions, SocketDriver};
use crate::outbound::Outbound;

/// Errors from plugin loading and execution.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Descriptor file could not be read.
    #[error("failed to read descriptor '{path}': {source}")]
    Io {
        /// Descriptor path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Descriptor file is not valid TOML.
    #[error("failed to parse descriptor '{path}': {source}")]
    Parse {
        /// Descriptor path.
        path: PathBuf,
        /// Underlying error.
        source: Box<toml::de::Error>,
    },

    /// A handler reported a database failure. The dispatcher retries these
    /// for groupmenu commands.
    #[error("database error: {0}")]
    Database(String),

    /// A handler failed.
    #[error("{0}")]
    Failed(String),

    /// A driver call inside a handler failed.
    #[error("driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),
}

impl PluginError {
    /// Whether the groupmenu retry policy applies.
    pub fn is_database_error(&self) -> bool {
        match self {
            PluginError::Database(_) => true,
            other => other.to_string().to_ascii_lowercase().contains("database"),
        }
    }
}

/// Menu category a plugin belongs to. Drives permission defaults and
/// error-reply deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginCategory {
    /// Public commands.
    MainMenu,
    /// Group administration commands.
    GroupMenu,
    /// Game commands.
    GameMenu,
    /// Bot-mode switches; exempt from the group-only gate.
    Mode,
    /// Owner-only utilities.
    Owner,
}

/// On-disk plugin descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    /// Unique plugin id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Menu category.
    pub category: PluginCategory,
    /// Compiled handler id; defaults to the plugin id.
    #[serde(default)]
    pub handler: Option<String>,
    /// Command names.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Command aliases.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Named permission bits (`owner`, `admin`, `vip`).
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Only the creator may run this.
    #[serde(default)]
    pub owner_only: bool,
    /// Only group admins may run this.
    #[serde(default)]
    pub admin_only: bool,
    /// Only VIP accounts may run this.
    #[serde(default)]
    pub vip_only: bool,
    /// Marks commands whose effect mutates shared database state; their
    /// execution is deduplicated across sessions.
    #[serde(default)]
    pub db_update: bool,
    /// Descriptor origin on disk; absent for programmatic registration.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl PluginDescriptor {
    /// The handler id this descriptor resolves to.
    pub fn handler_id(&self) -> &str {
        self.handler.as_deref().unwrap_or(&self.id)
    }
}

/// Context handed to command handlers.
pub struct CommandContext {
    /// Executing session.
    pub session_id: String,
    /// Chat the command arrived in.
    pub chat_id: String,
    /// Sender jid.
    pub sender_id: String,
    /// Whether the chat is a group.
    pub is_group: bool,
    /// Whether the sender is the session's own phone.
    pub is_creator: bool,
    /// Resolved command name (no prefix, lowercased).
    pub command: String,
    /// Remaining whitespace-separated arguments.
    pub args: Vec<String>,
    /// The raw message.
    pub message: InboundMessage,
    /// Category the resolved plugin belongs to.
    pub category: PluginCategory,
    /// Driver of the executing session.
    pub driver: Arc<dyn SocketDriver>,
    /// Shared outbound path.
    pub outbound: Arc<Outbound>,
}

impl CommandContext {
    /// Reply into the originating chat.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Driver`] when the send fails after retries.
    pub async fn reply(&self, text: impl Into<String>) -> Result<(), PluginError> {
        self.outbound
            .send(
                self.driver.as_ref(),
                &self.chat_id,
                MessageContent::text(text),
                SendOptions::default(),
            )
            .await?;
        Ok(())
    }
}

/// Context handed to anti-plugin scans.
pub struct ScanContext {
    /// Scanning session.
    pub session_id: String,
    /// Chat the message arrived in.
    pub chat_id: String,
    /// Whether the chat is a group.
    pub is_group: bool,
    /// The message under scan.
    pub message: InboundMessage,
    /// Driver of the scanning session.
    pub driver: Arc<dyn SocketDriver>,
    /// Shared outbound path.
    pub outbound: Arc<Outbound>,
}

impl ScanContext {
    /// Reply into the scanned chat.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Driver`] when the send fails after retries.
    pub async fn reply(&self, text: impl Into<String>) -> Result<(), PluginError> {
        self.outbound
            .send(
                self.driver.as_ref(),
                &self.chat_id,
                MessageContent::text(text),
                SendOptions::default(),
            )
            .await?;
        Ok(())
    }
}

/// A compiled plugin handler.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Run the command.
    async fn execute(&self, ctx: &CommandContext) -> Result<(), PluginError>;

    /// Whether this handler also scans every inbound message.
    fn scans(&self) -> bool {
        false
    }

    /// Scan one inbound message. Only called when [`scans`](Plugin::scans)
    /// is true and the gates pass.
    async fn process_message(&self, _ctx: &ScanContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Per-chat enable gate for the scan path.
    fn is_enabled(&self, _chat_id: &str) -> bool {
        true
    }

    /// Cheap per-message predicate for the scan path.
    fn should_process(&self, _msg: &InboundMessage) -> bool {
        true
    }
}

/// Joins descriptors to handlers and owns the command index.
pub struct PluginHost {
    handlers: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    descriptors: RwLock<HashMap<String, PluginDescriptor>>,
    /// command/alias (lowercased) → plugin id. Replaced whole on rebuild.
    index: RwLock<Arc<HashMap<String, String>>>,
    /// Plugin ids whose handlers scan, in load order.
    anti: RwLock<Arc<Vec<String>>>,
}

impl PluginHost {
    /// Empty host.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
            index: RwLock::new(Arc::new(HashMap::new())),
            anti: RwLock::new(Arc::new(Vec::new())),
        })
    }

    /// Register a compiled handler.
    pub fn register_handler(&self, id: impl Into<String>, handler: Arc<dyn Plugin>) {
        self.handlers.write().unwrap().insert(id.into(), handler);
    }

    /// Register a descriptor directly (tests, embedded plugins) and rebuild
    /// the index.
    pub fn register_descriptor(&self, descriptor: PluginDescriptor) {
        self.descriptors
            .write()
            .unwrap()
            .insert(descriptor.id.clone(), descriptor);
        self.rebuild_index();
    }

    /// Load every descriptor under a directory tree.
    ///
    /// Descriptors without a registered handler are skipped with a warning.
    /// Returns the number of active descriptors after the load.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Io`] when the tree cannot be walked. A single
    /// unreadable or unparsable file is logged and skipped.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, PluginError> {
        let mut paths = Vec::new();
        collect_descriptor_paths(dir, &mut paths).map_err(|source| PluginError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        for path in paths {
            if let Err(e) = self.load_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "skipping bad descriptor");
            }
        }
        self.rebuild_index();
        Ok(self.descriptors.read().unwrap().len())
    }

    /// Load or replace the descriptor at one path without rebuilding the
    /// index. Used by [`load_dir`](Self::load_dir) and the watcher.
    fn load_file(&self, path: &Path) -> Result<(), PluginError> {
        let content = std::fs::read_to_string(path).map_err(|source| PluginError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut descriptor: PluginDescriptor =
            toml::from_str(&content).map_err(|source| PluginError::Parse {
                path: path.to_path_buf(),
                source: Box::new(source),
            })?;
        descriptor.source = Some(path.to_path_buf());

        if !self
            .handlers
            .read()
            .unwrap()
            .contains_key(descriptor.handler_id())
        {
            tracing::warn!(
                plugin = descriptor.id,
                handler = descriptor.handler_id(),
                "descriptor references unknown handler, skipping"
            );
            return Ok(());
        }

        tracing::debug!(plugin = descriptor.id, path = %path.display(), "descriptor loaded");
        self.descriptors
            .write()
            .unwrap()
            .insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Hot-reload one changed (or deleted) descriptor path, then rebuild the
    /// command index.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Parse`] or [`PluginError::Io`] when a present
    /// file cannot be loaded; the previous descriptor from that path is
    /// dropped regardless, so a broken edit disables the plugin instead of
    /// freezing a stale version.
    pub fn reload_path(&self, path: &Path) -> Result<(), PluginError> {
        self.descriptors
            .write()
            .unwrap()
            .retain(|_, d| d.source.as_deref() != Some(path));

        let result = if path.exists() {
            self.load_file(path)
        } else {
            tracing::info!(path = %path.display(), "descriptor removed");
            Ok(())
        };
        self.rebuild_index();
        result
    }

    /// Rebuild the command index and anti-plugin list from the current
    /// descriptor set and swap them in atomically.
    pub fn rebuild_index(&self) {
        let descriptors = self.descriptors.read().unwrap();
        let handlers = self.handlers.read().unwrap();

        let mut index = HashMap::new();
        let mut anti = Vec::new();
        for descriptor in descriptors.values() {
            for command in descriptor.commands.iter().chain(&descriptor.aliases) {
                index.insert(command.to_ascii_lowercase(), descriptor.id.clone());
            }
            if handlers
                .get(descriptor.handler_id())
                .is_some_and(|h| h.scans())
            {
                anti.push(descriptor.id.clone());
            }
        }
        anti.sort();
        drop(descriptors);
        drop(handlers);

        *self.index.write().unwrap() = Arc::new(index);
        *self.anti.write().unwrap() = Arc::new(anti);
    }

    /// O(1) command resolution to `(descriptor, handler)`.
    pub fn resolve(&self, command: &str) -> Option<(PluginDescriptor, Arc<dyn Plugin>)> {
        let index: Arc<HashMap<String, String>> = self.index.read().unwrap().clone();
        let plugin_id = index.get(&command.to_ascii_lowercase())?;
        let descriptor = self.descriptors.read().unwrap().get(plugin_id)?.clone();
        let handler = Arc::clone(self.handlers.read().unwrap().get(descriptor.handler_id())?);
        Some((descriptor, handler))
    }

    /// All anti-plugins, in stable order.
    pub fn anti_plugins(&self) -> Vec<(PluginDescriptor, Arc<dyn Plugin>)> {
        let ids: Arc<Vec<String>> = self.anti.read().unwrap().clone();
        let descriptors = self.descriptors.read().unwrap();
        let handlers = self.handlers.read().unwrap();
        ids.iter()
            .filter_map(|id| {
                let descriptor = descriptors.get(id)?.clone();
                let handler = Arc::clone(handlers.get(descriptor.handler_id())?);
                Some((descriptor, handler))
            })
            .collect()
    }

    /// Number of active descriptors.
    pub fn descriptor_count(&self) -> usize {
        self.descriptors.read().unwrap().len()
    }

    /// Snapshot of every command in the index.
    pub fn commands(&self) -> Vec<String> {
        let index = self.index.read().unwrap();
        let mut commands: Vec<String> = index.keys().cloned().collect();
        commands.sort();
        commands
    }
}

fn collect_descriptor_paths(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_descriptor_paths(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct NoopPlugin;

    #[async_trait]
    impl Plugin for NoopPlugin {
        async fn execute(&self, _ctx: &CommandContext) -> Result<(), PluginError> {
            Ok(())
        }
    }

    struct ScanningPlugin;

    #[async_trait]
    impl Plugin for ScanningPlugin {
        async fn execute(&self, _ctx: &CommandContext) -> Result<(), PluginError> {
            Ok(())
        }

        fn scans(&self) -> bool {
            true
        }
    }

    fn write_descriptor(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    const PING: &str = r#"
id = "ping"
name = "Ping"
category = "mainmenu"
commands = ["ping"]
aliases = ["p"]
"#;

    #[test]
    fn test_load_dir_builds_index() {
        let dir = TempDir::new().unwrap();
        write_descriptor(dir.path(), "mainmenu/ping.toml", PING);

        let host = PluginHost::new();
        host.register_handler("ping", Arc::new(NoopPlugin));
        let count = host.load_dir(dir.path()).unwrap();

        assert_eq!(count, 1);
        assert!(host.resolve("ping").is_some());
        assert!(host.resolve("PING").is_some(), "lookup is case-insensitive");
        assert!(host.resolve("p").is_some(), "aliases resolve");
        assert!(host.resolve("pong").is_none());
    }

    #[test]
    fn test_unknown_handler_skipped() {
        let dir = TempDir::new().unwrap();
        write_descriptor(
            dir.path(),
            "mainmenu/ghost.toml",
            r#"
id = "ghost"
name = "Ghost"
category = "mainmenu"
commands = ["ghost"]
"#,
        );

        let host = PluginHost::new();
        let count = host.load_dir(dir.path()).unwrap();
        assert_eq!(count, 0);
        assert!(host.resolve("ghost").is_none());
    }

    #[test]
    fn test_reload_swaps_commands() {
        let dir = TempDir::new().unwrap();
        let path = write_descriptor(dir.path(), "mainmenu/ping.toml", PING);

        let host = PluginHost::new();
        host.register_handler("ping", Arc::new(NoopPlugin));
        host.load_dir(dir.path()).unwrap();

        // The edit renames the command set.
        std::fs::write(
            &path,
            r#"
id = "ping"
name = "Ping"
category = "mainmenu"
commands = ["latency"]
"#,
        )
        .unwrap();
        host.reload_path(&path).unwrap();

        assert!(host.resolve("latency").is_some());
        assert!(
            host.resolve("ping").is_none(),
            "old command must be unreachable after reload"
        );
        assert!(host.resolve("p").is_none(), "old alias dropped too");
    }

    #[test]
    fn test_reload_removed_file_drops_plugin() {
        let dir = TempDir::new().unwrap();
        let path = write_descriptor(dir.path(), "mainmenu/ping.toml", PING);

        let host = PluginHost::new();
        host.register_handler("ping", Arc::new(NoopPlugin));
        host.load_dir(dir.path()).unwrap();

        std::fs::remove_file(&path).unwrap();
        host.reload_path(&path).unwrap();

        assert_eq!(host.descriptor_count(), 0);
        assert!(host.resolve("ping").is_none());
    }

    #[test]
    fn test_reload_does_not_disturb_other_plugins() {
        let dir = TempDir::new().unwrap();
        let ping_path = write_descriptor(dir.path(), "mainmenu/ping.toml", PING);
        write_descriptor(
            dir.path(),
            "groupmenu/kick.toml",
            r#"
id = "kick"
name = "Kick"
category = "groupmenu"
commands = ["kick"]
admin_only = true
db_update = true
"#,
        );

        let host = PluginHost::new();
        host.register_handler("ping", Arc::new(NoopPlugin));
        host.register_handler("kick", Arc::new(NoopPlugin));
        host.load_dir(dir.path()).unwrap();

        host.reload_path(&ping_path).unwrap();

        let (kick, _) = host.resolve("kick").expect("kick untouched by ping reload");
        assert!(kick.admin_only);
        assert!(kick.db_update);
    }

    #[test]
    fn test_anti_plugins_listed_from_scanning_handlers() {
        let dir = TempDir::new().unwrap();
        write_descriptor(
            dir.path(),
            "anti/antilink.toml",
            r#"
id = "antilink"
name = "Anti Link"
category = "groupmenu"
"#,
        );
        write_descriptor(dir.path(), "mainmenu/ping.toml", PING);

        let host = PluginHost::new();
        host.register_handler("antilink", Arc::new(ScanningPlugin));
        host.register_handler("ping", Arc::new(NoopPlugin));
        host.load_dir(dir.path()).unwrap();

        let anti = host.anti_plugins();
        assert_eq!(anti.len(), 1);
        assert_eq!(anti[0].0.id, "antilink");
    }

    #[test]
    fn test_handler_field_overrides_id() {
        let host = PluginHost::new();
        host.register_handler("shared", Arc::new(NoopPlugin));
        host.register_descriptor(PluginDescriptor {
            id: "alpha".to_string(),
            name: "Alpha".to_string(),
            category: PluginCategory::MainMenu,
            handler: Some("shared".to_string()),
            commands: vec!["alpha".to_string()],
            aliases: Vec::new(),
            permissions: Vec::new(),
            owner_only: false,
            admin_only: false,
            vip_only: false,
            db_update: false,
            source: None,
        });

        assert!(host.resolve("alpha").is_some());
    }

    #[test]
    fn test_is_database_error() {
        assert!(PluginError::Database("lock".to_string()).is_database_error());
        assert!(PluginError::Failed("Database timeout".to_string()).is_database_error());
        assert!(!PluginError::Failed("network".to_string()).is_database_error());
    }
}
