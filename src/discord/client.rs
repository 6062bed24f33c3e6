//! Discord gateway session.
//!
//! Wraps the serenity client: forwards guild messages and member presence
//! into the bridge queues, and answers avatar lookups from the gateway cache.

use std::sync::Arc;

use serenity::async_trait;
use serenity::cache::Cache;
use serenity::gateway::ShardManager;
use serenity::model::channel::Message;
use serenity::model::gateway::{Presence, Ready};
use serenity::model::guild::{Guild, Member};
use serenity::model::id::{GuildId, UserId};
use serenity::model::user::OnlineStatus;
use serenity::prelude::*;
use serenity::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::error::DiscordError;
use crate::discord::api::build_http;
use crate::common::{DiscordMessage, DiscordUser};

/// The Discord side of the bridge as seen by the coordinator.
#[async_trait]
pub trait DiscordSession: Send + Sync {
    /// Connect to the gateway and start forwarding events.
    async fn open(&mut self) -> Result<(), DiscordError>;

    /// Avatar of the guild member called `username`, if there is one.
    fn avatar_url(&self, username: &str) -> Option<String>;

    /// Disconnect from the gateway.
    async fn close(&mut self);
}

/// Parse a snowflake into a guild ID.
pub fn parse_guild_id(value: &str) -> Result<GuildId, DiscordError> {
    match value.parse::<u64>() {
        Ok(id) if id != 0 => Ok(GuildId::new(id)),
        _ => Err(DiscordError::InvalidId {
            value: value.to_string(),
        }),
    }
}

fn is_online(status: OnlineStatus) -> bool {
    !matches!(status, OnlineStatus::Offline | OnlineStatus::Invisible)
}

fn member_to_user(member: &Member, online: bool) -> DiscordUser {
    DiscordUser {
        id: member.user.id.to_string(),
        username: member.user.name.clone(),
        nick: member.nick.clone(),
        bot: member.user.bot,
        online,
    }
}

fn cached_member(guild: &Guild, user_id: UserId, online: bool) -> Option<DiscordUser> {
    guild.members.get(&user_id).map(|member| member_to_user(member, online))
}

struct DiscordEvents {
    guild_id: GuildId,
    simple_mode: bool,
    message_tx: mpsc::UnboundedSender<DiscordMessage>,
    user_tx: mpsc::UnboundedSender<DiscordUser>,
}

impl DiscordEvents {
    fn send_user(&self, user: DiscordUser) {
        if self.simple_mode {
            return;
        }
        if let Err(error) = self.user_tx.send(user) {
            warn!("Failed to process discord user update: {}", error);
        }
    }
}

#[async_trait]
impl EventHandler for DiscordEvents {
    async fn ready(&self, _context: Context, ready: Ready) {
        info!("Discord bot connected as {}", ready.user.name);
    }

    async fn guild_create(&self, _context: Context, guild: Guild, _is_new: Option<bool>) {
        if guild.id != self.guild_id {
            return;
        }
        info!(guild = %guild.name, members = guild.members.len(), "Guild available");

        for member in guild.members.values() {
            let online = guild
                .presences
                .get(&member.user.id)
                .is_some_and(|p| is_online(p.status));
            self.send_user(member_to_user(member, online));
        }
    }

    async fn presence_update(&self, context: Context, presence: Presence) {
        if presence.guild_id != Some(self.guild_id) {
            return;
        }
        let online = is_online(presence.status);

        let cached = context
            .cache
            .guild(self.guild_id)
            .and_then(|guild| cached_member(&guild, presence.user.id, online));

        let user = match cached {
            Some(user) => user,
            None => match presence.user.name.clone() {
                Some(username) => DiscordUser {
                    id: presence.user.id.to_string(),
                    username,
                    nick: None,
                    bot: presence.user.bot.unwrap_or(false),
                    online,
                },
                None => {
                    debug!(user_id = %presence.user.id, "Presence update for unknown member");
                    return;
                }
            },
        };
        self.send_user(user);
    }

    async fn message(&self, context: Context, message: Message) {
        if message.guild_id != Some(self.guild_id) {
            return;
        }
        if message.author.id == context.cache.current_user().id {
            return;
        }

        let mut content = message.content.clone();
        for attachment in &message.attachments {
            if !content.is_empty() {
                content.push(' ');
            }
            content.push_str(&attachment.url);
        }

        let author = DiscordUser {
            id: message.author.id.to_string(),
            username: message.author.name.clone(),
            nick: message.member.as_ref().and_then(|m| m.nick.clone()),
            bot: message.author.bot,
            online: true,
        };

        let event = DiscordMessage {
            channel_id: message.channel_id.to_string(),
            author,
            content,
            webhook_id: message.webhook_id.map(|id| id.to_string()),
        };
        if let Err(error) = self.message_tx.send(event) {
            warn!("Failed to process discord message: {}", error);
        }
    }
}

async fn build_client(token: &str, events: DiscordEvents) -> Result<Client, DiscordError> {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_PRESENCES;

    let http = build_http(token)?;

    let client = serenity::client::ClientBuilder::new_with_http(http, intents)
        .event_handler(events)
        .await?;
    Ok(client)
}

/// The bot's gateway connection.
pub struct DiscordBot {
    token: String,
    guild_id: GuildId,
    simple_mode: bool,
    message_tx: mpsc::UnboundedSender<DiscordMessage>,
    user_tx: mpsc::UnboundedSender<DiscordUser>,
    cache: Option<Arc<Cache>>,
    shard_manager: Option<Arc<ShardManager>>,
    task: Option<JoinHandle<()>>,
}

impl DiscordBot {
    pub fn new(
        token: &str,
        guild_id: &str,
        simple_mode: bool,
        message_tx: mpsc::UnboundedSender<DiscordMessage>,
        user_tx: mpsc::UnboundedSender<DiscordUser>,
    ) -> Result<Self, DiscordError> {
        Ok(Self {
            token: token.to_string(),
            guild_id: parse_guild_id(guild_id)?,
            simple_mode,
            message_tx,
            user_tx,
            cache: None,
            shard_manager: None,
            task: None,
        })
    }
}

#[async_trait]
impl DiscordSession for DiscordBot {
    async fn open(&mut self) -> Result<(), DiscordError> {
        if self.task.is_some() {
            return Err(DiscordError::AlreadyOpen);
        }

        let events = DiscordEvents {
            guild_id: self.guild_id,
            simple_mode: self.simple_mode,
            message_tx: self.message_tx.clone(),
            user_tx: self.user_tx.clone(),
        };
        let mut client = build_client(&self.token, events).await?;

        self.cache = Some(client.cache.clone());
        self.shard_manager = Some(client.shard_manager.clone());

        info!("Connecting to Discord...");
        // serenity reconnects dropped shards on its own; start() only
        // returns on fatal errors such as an invalid token.
        self.task = Some(tokio::spawn(async move {
            match client.start().await {
                Ok(()) => info!("Discord client disconnected normally"),
                Err(e) => error!("Discord client error: {}", e),
            }
        }));
        Ok(())
    }

    fn avatar_url(&self, username: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        let guild = cache.guild(self.guild_id)?;
        guild.member_named(username).map(|member| member.user.face())
    }

    async fn close(&mut self) {
        if let Some(manager) = self.shard_manager.take() {
            info!("Initiating graceful Discord shutdown...");
            manager.shutdown_all().await;
            info!("Discord shutdown complete");
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Discord task ended abnormally: {}", e);
            }
        }
        self.cache = None;
    }
}
