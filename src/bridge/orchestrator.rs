//! Bridge coordinator.
//!
//! Owns the mapping registry, the webhook pool and the IRC user connections,
//! and is the only task that mutates them. Everything else reaches it through
//! the queues in [`super::channels`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::channels::{BridgeCommand, BridgeReceivers};
use crate::bridge::mapping::{Mapping, MappingRegistry};
use crate::common::error::BridgeError;
use crate::common::{DiscordMessage, DiscordUser, IrcMessage};
use crate::config::types::Config;
use crate::discord::api::{WebhookApi, WebhookParams};
use crate::discord::client::DiscordSession;
use crate::discord::webhooks::{WebhookExpiry, WebhookPool};
use crate::irc::{IrcManager, Listener};

/// The collaborators a bridge drives.
pub struct Collaborators {
    pub discord: Box<dyn DiscordSession>,
    pub listener: Arc<dyn Listener>,
    pub users: IrcManager,
    pub webhooks: Arc<dyn WebhookApi>,
}

/// Replace `%user` in an avatar template with the URL-escaped nick.
fn fallback_avatar(template: &str, username: &str) -> String {
    template.replace("%user", &urlencoding::encode(username))
}

/// The main bridge that routes messages between IRC and Discord.
pub struct Bridge {
    mappings: MappingRegistry,
    discord: Box<dyn DiscordSession>,
    listener: Arc<dyn Listener>,
    users: IrcManager,
    pool: WebhookPool,
    fallback_avatar_url: String,
    expiry_rx: mpsc::UnboundedReceiver<WebhookExpiry>,
    receivers: BridgeReceivers,
}

impl Bridge {
    /// Create a bridge. Nothing is connected until [`Bridge::open`].
    pub fn new(
        config: &Config,
        parts: Collaborators,
        receivers: BridgeReceivers,
    ) -> Result<Self, BridgeError> {
        if config.irc.server.is_empty() {
            return Err(BridgeError::InvalidConfig("missing server name".to_string()));
        }
        if config.webhooks.prefix.is_empty() {
            return Err(BridgeError::InvalidConfig("missing webhook prefix".to_string()));
        }

        let mut mappings = MappingRegistry::new();
        mappings
            .set_mappings(config.channel_mappings.iter().map(Mapping::from).collect())
            .map_err(|e| {
                BridgeError::InvalidConfig(format!("channel mappings could not be set: {}", e))
            })?;
        info!("Configured {} channel mappings", mappings.len());

        let (pool, expiry_rx) = WebhookPool::new(
            parts.webhooks,
            &config.webhooks.prefix,
            Duration::from_secs(config.webhooks.expiry_secs),
        );

        Ok(Self {
            mappings,
            discord: parts.discord,
            listener: parts.listener,
            users: parts.users,
            pool,
            fallback_avatar_url: config.webhooks.fallback_avatar_url.clone(),
            expiry_rx,
            receivers,
        })
    }

    /// Connect to Discord, then to IRC.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        self.discord.open().await?;

        self.listener.join_channels(&self.mappings.irc_channels());
        self.listener.connect().await?;
        Ok(())
    }

    /// Run the event loop in its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events until shut down.
    pub async fn run(mut self) {
        info!("Bridge running");

        loop {
            tokio::select! {
                // Control requests are served ahead of queued traffic; nothing
                // queued is processed after a shutdown.
                biased;

                command = self.receivers.command_rx.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("Control handle dropped, shutting down");
                            self.shutdown().await;
                            false
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(expiry) = self.expiry_rx.recv() => self.pool.handle_expiry(expiry),
                Some(message) = self.receivers.irc_rx.recv() => self.handle_irc_message(message).await,
                Some(message) = self.receivers.discord_rx.recv() => self.handle_discord_message(message),
                Some(user) = self.receivers.user_rx.recv() => self.handle_user_update(user),
            }
        }

        info!("Bridge stopped");
    }

    /// Apply a control request. Returns `false` once the bridge is shut down.
    async fn handle_command(&mut self, command: BridgeCommand) -> bool {
        match command {
            BridgeCommand::SetMappings { mappings, reply } => {
                let result = self.set_mappings(mappings);
                if let Err(ref e) = result {
                    warn!("Channel mappings rejected: {}", e);
                }
                if reply.send(result).is_err() {
                    debug!("Mapping requester went away");
                }
            }
            BridgeCommand::SetListenerName(name) => {
                info!(nick = %name, "Renaming IRC listener");
                self.listener.set_nick(&name);
            }
            BridgeCommand::SetDebug(enabled) => {
                info!(enabled, "Setting IRC debug mode");
                self.listener.set_debug_mode(enabled);
                self.users.set_debug_mode(enabled);
            }
            BridgeCommand::Shutdown { done } => {
                self.shutdown().await;
                if done.send(()).is_err() {
                    debug!("Shutdown requester went away");
                }
                return false;
            }
        }
        true
    }

    /// Replace the mapping set, then part and join so every IRC connection
    /// sits in exactly the mapped channels.
    fn set_mappings(&mut self, mappings: Vec<Mapping>) -> Result<(), BridgeError> {
        let Some(reconciliation) = self.mappings.set_mappings(mappings)? else {
            return Ok(());
        };

        if !reconciliation.part.is_empty() {
            let part = format!("PART {}", reconciliation.part.join(","));
            self.listener.send_raw(&part);
            for connection in self.users.connections() {
                connection.send_raw(&part);
            }
        }

        self.listener.join_channels(&reconciliation.join);
        for connection in self.users.connections() {
            connection.join_channels(&reconciliation.join);
        }

        info!(
            parted = reconciliation.part.len(),
            channels = reconciliation.join.len(),
            "Channel mappings updated"
        );
        Ok(())
    }

    async fn handle_irc_message(&mut self, message: IrcMessage) {
        let Some(mapping) = self.mappings.by_irc(&message.irc_channel) else {
            warn!(channel = %message.irc_channel, "Ignoring message sent from an unhandled IRC channel");
            return;
        };
        let channel_id = mapping.discord_channel.clone();

        let avatar_url = self
            .discord
            .avatar_url(&message.username)
            .unwrap_or_else(|| fallback_avatar(&self.fallback_avatar_url, &message.username));

        let params = WebhookParams {
            content: message.message,
            username: message.username,
            avatar_url,
        };

        if let Err(e) = self.pool.execute(&channel_id, &params).await {
            error!(
                error = %e,
                channel_id = %channel_id,
                params = ?params,
                "Could not send message to Discord"
            );
        }
    }

    fn handle_discord_message(&mut self, message: DiscordMessage) {
        if let Some(webhook_id) = message.webhook_id.as_deref() {
            if self.pool.contains(webhook_id) {
                trace!(webhook_id, "Ignoring message from own webhook");
                return;
            }
        }

        let Some(mapping) = self.mappings.by_discord(&message.channel_id) else {
            trace!(channel_id = %message.channel_id, "Ignoring message sent from an unhandled Discord channel");
            return;
        };

        self.users.send_message(&mapping.irc_channel, &message);
    }

    fn handle_user_update(&mut self, user: DiscordUser) {
        let channels = self.mappings.irc_channels();
        self.users.handle_user(&user, &channels);
    }

    async fn shutdown(&mut self) {
        info!("Shutting down bridge...");
        self.discord.close().await;
        self.listener.quit();
        self.pool.destroy().await;
        self.users.close();
    }
}
