//! Configuration type definitions.

use serde::Deserialize;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub discord: DiscordConfig,
    pub irc: IrcConfig,
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub channel_mappings: Vec<ChannelMapping>,
    #[serde(default)]
    pub debug: bool,
}

/// Discord bot configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    pub token: String,
    /// Guild (server) ID the bridge operates in.
    pub guild_id: String,
}

/// IRC server connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IrcConfig {
    /// Server address, `host:port`.
    pub server: String,
    /// Nick of the listener connection that relays IRC -> Discord.
    pub listener_name: String,
    /// WEBIRC password for upstream identification of bridged users.
    #[serde(default)]
    pub webirc_pass: Option<String>,
    /// Accept any server certificate. Only meant for testing.
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Do not spawn an IRC connection per online Discord user.
    #[serde(default)]
    pub simple_mode: bool,
    /// Appended to Discord users' nicks on the IRC side.
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

/// Webhook pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Prefix of every webhook name created by the bot.
    pub prefix: String,
    /// Idle seconds before a pooled webhook is considered expired.
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
    /// Avatar used when the IRC speaker has no Discord avatar. `%user` is
    /// replaced with the speaker's nick.
    #[serde(default = "default_fallback_avatar")]
    pub fallback_avatar_url: String,
}

/// Maps an IRC channel to a Discord channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelMapping {
    /// IRC channel name, e.g. `#general`.
    pub irc: String,
    /// Discord channel ID.
    pub discord: String,
}

fn default_use_tls() -> bool {
    true
}

fn default_suffix() -> String {
    "~d".to_string()
}

fn default_expiry_secs() -> u64 {
    5
}

fn default_fallback_avatar() -> String {
    "https://robohash.org/%user?set=set4&size=128x128".to_string()
}
