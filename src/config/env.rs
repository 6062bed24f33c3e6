//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `DISCIRC_DISCORD_TOKEN` - Discord bot token
//! - `DISCIRC_GUILD_ID` - Discord guild ID
//! - `DISCIRC_IRC_SERVER` - IRC server address
//! - `DISCIRC_WEBIRC_PASS` - WEBIRC password

use std::env;

use crate::config::types::Config;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "DISCIRC";

/// Apply environment variable overrides to a config.
///
/// This allows secrets to be provided via environment variables
/// instead of the config file.
pub fn apply_env_overrides(mut config: Config) -> Config {
    if let Ok(token) = env::var(format!("{}_DISCORD_TOKEN", ENV_PREFIX)) {
        config.discord.token = token;
    }
    if let Ok(guild_id) = env::var(format!("{}_GUILD_ID", ENV_PREFIX)) {
        config.discord.guild_id = guild_id;
    }

    if let Ok(server) = env::var(format!("{}_IRC_SERVER", ENV_PREFIX)) {
        config.irc.server = server;
    }
    if let Ok(pass) = env::var(format!("{}_WEBIRC_PASS", ENV_PREFIX)) {
        config.irc.webirc_pass = Some(pass).filter(|p| !p.is_empty());
    }

    config
}

/// Get the config file path from environment or use default.
///
/// Checks `DISCIRC_CONFIG`, otherwise returns "discirc.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "discirc.conf".to_string())
}
