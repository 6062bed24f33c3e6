//! Configuration validation.
//!
//! Validates configuration values and provides helpful error messages.

use crate::bridge::mapping::{check_unique, Mapping};
use crate::common::error::ConfigError;
use crate::config::types::Config;

/// Validate a configuration and return detailed errors.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    // Discord
    if config.discord.token.is_empty() {
        errors.push("discord.token is required".to_string());
    }
    if config.discord.token == "YOUR_DISCORD_TOKEN_HERE" {
        errors.push("discord.token has not been configured (still using placeholder)".to_string());
    }
    if config.discord.guild_id.parse::<u64>().is_err() {
        errors.push(format!(
            "discord.guild_id must be a numeric guild ID (got '{}')",
            config.discord.guild_id
        ));
    }

    // IRC
    if config.irc.server.is_empty() {
        errors.push("irc.server is required (missing server name)".to_string());
    }
    if config.irc.listener_name.is_empty() {
        errors.push("irc.listener_name is required".to_string());
    }

    // Webhooks
    if config.webhooks.prefix.is_empty() {
        errors.push("webhooks.prefix is required (missing webhook prefix)".to_string());
    }
    if config.webhooks.expiry_secs == 0 {
        errors.push("webhooks.expiry_secs must be non-zero".to_string());
    }

    // Channel mappings
    for (i, mapping) in config.channel_mappings.iter().enumerate() {
        if !mapping.irc.starts_with('#') && !mapping.irc.starts_with('&') {
            errors.push(format!(
                "channel_mappings[{}].irc '{}' is not an IRC channel name",
                i, mapping.irc
            ));
        }
        if mapping.discord.parse::<u64>().is_err() {
            errors.push(format!(
                "channel_mappings[{}].discord '{}' must be a numeric channel ID",
                i, mapping.discord
            ));
        }
    }

    let mappings: Vec<Mapping> = config.channel_mappings.iter().map(Mapping::from).collect();
    if let Err(e) = check_unique(&mappings) {
        errors.push(format!("channel mappings could not be set: {}", e));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}
