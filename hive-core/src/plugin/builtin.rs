//! Built-in plugin handlers.
//!
//! The handler set shipped with the runtime. Deployments register their own
//! handlers next to these before loading descriptors.

use std::sync::Arc;

use async_trait::async_trait;

use super::{CommandContext, Plugin, PluginError, PluginHost, ScanContext};

/// Liveness check: replies `pong` with the round-trip prefix echo.
pub struct PingPlugin;

#[async_trait]
impl Plugin for PingPlugin {
    async fn execute(&self, ctx: &CommandContext) -> Result<(), PluginError> {
        ctx.reply("pong").await
    }
}

/// Warns when a group message carries an outside link.
pub struct AntiLinkPlugin;

impl AntiLinkPlugin {
    fn contains_link(text: &str) -> bool {
        let lowered = text.to_ascii_lowercase();
        lowered.contains("http://")
            || lowered.contains("https://")
            || lowered.contains("chat.whatsapp.com/")
    }
}

#[async_trait]
impl Plugin for AntiLinkPlugin {
    async fn execute(&self, ctx: &CommandContext) -> Result<(), PluginError> {
        // The command form just reports the scan status.
        ctx.reply("anti-link is active in this chat").await
    }

    fn scans(&self) -> bool {
        true
    }

    fn should_process(&self, msg: &crate::driver::InboundMessage) -> bool {
        msg.text.as_deref().is_some_and(Self::contains_link)
    }

    async fn process_message(&self, ctx: &ScanContext) -> Result<(), PluginError> {
        if !ctx.is_group {
            return Ok(());
        }
        tracing::info!(
            chat_id = ctx.chat_id,
            message_id = ctx.message.key.id,
            "link detected by anti-link scan"
        );
        ctx.reply("links are not allowed in this group").await
    }
}

/// Register every built-in handler on a host.
pub fn register_builtin_handlers(host: &PluginHost) {
    host.register_handler("ping", Arc::new(PingPlugin));
    host.register_handler("antilink", Arc::new(AntiLinkPlugin));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_detection() {
        assert!(AntiLinkPlugin::contains_link("join https://example.com now"));
        assert!(AntiLinkPlugin::contains_link("HTTP://CAPS.example"));
        assert!(AntiLinkPlugin::contains_link("chat.whatsapp.com/AbCd"));
        assert!(!AntiLinkPlugin::contains_link("no links here"));
    }

    #[test]
    fn test_builtins_register() {
        let host = PluginHost::new();
        register_builtin_handlers(&host);
        host.register_descriptor(crate::plugin::PluginDescriptor {
            id: "ping".to_string(),
            name: "Ping".to_string(),
            category: crate::plugin::PluginCategory::MainMenu,
            handler: None,
            commands: vec!["ping".to_string()],
            aliases: Vec::new(),
            permissions: Vec::new(),
            owner_only: false,
            admin_only: false,
            vip_only: false,
            db_update: false,
            source: None,
        });
        assert!(host.resolve("ping").is_some());
    }
}
