//! Canonical message types for bridge communication.
//!
//! These are the payloads that collaborator tasks push onto the
//! coordinator's event queues.

/// A channel message received by the IRC listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    /// IRC channel the message was sent to (e.g. `#general`).
    pub irc_channel: String,
    /// Nick of the speaker.
    pub username: String,
    /// Message text.
    pub message: String,
}

/// A Discord guild member as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordUser {
    /// Discord user ID.
    pub id: String,
    /// Account username.
    pub username: String,
    /// Guild nickname, if set.
    pub nick: Option<String>,
    /// Whether the account is a bot.
    pub bot: bool,
    /// Whether the member is currently online.
    pub online: bool,
}

impl DiscordUser {
    /// Effective name shown in the guild.
    pub fn display_name(&self) -> &str {
        self.nick.as_deref().unwrap_or(&self.username)
    }
}

/// A message posted in a Discord guild channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordMessage {
    /// Discord channel ID.
    pub channel_id: String,
    /// Author of the message.
    pub author: DiscordUser,
    /// Message content with attachment URLs appended.
    pub content: String,
    /// Set when the message was posted through a webhook.
    pub webhook_id: Option<String>,
}
