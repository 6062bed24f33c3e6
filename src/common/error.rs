//! Error types for the application.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {message}")]
    IoError { path: String, message: String },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },
}

/// Errors raised by the bridge coordinator and its control handle.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("channel_mappings contains duplicate entries (channel '{channel}')")]
    DuplicateMapping { channel: String },

    #[error("Configuration invalid: {0}")]
    InvalidConfig(String),

    #[error("Bridge is not running")]
    Closed,

    #[error("Discord error: {0}")]
    Discord(#[from] DiscordError),

    #[error("IRC error: {0}")]
    Irc(#[from] IrcError),
}

/// Discord-related errors (REST and gateway).
#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Invalid snowflake '{value}'")]
    InvalidId { value: String },

    #[error("Discord session already opened")]
    AlreadyOpen,

    #[error("Serenity error: {0}")]
    Serenity(#[from] serenity::Error),
}

/// Errors surfaced by the webhook pool for a single send.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Creation failed and no pooled webhook could be taken over.
    #[error("No webhook available for channel {channel_id}: {source}")]
    Exhausted {
        channel_id: String,
        #[source]
        source: DiscordError,
    },

    #[error("Webhook {id} disappeared from the pool")]
    Missing { id: String },

    #[error(transparent)]
    Discord(#[from] DiscordError),
}

/// IRC connection errors.
#[derive(Debug, Error)]
pub enum IrcError {
    #[error("Failed to connect to {server}: {source}")]
    ConnectFailed {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection already started")]
    AlreadyStarted,

    #[error("Connection closed by server: {reason}")]
    Closed { reason: String },
}

/// Result type alias for Discord operations.
pub type DiscordResult<T> = std::result::Result<T, DiscordError>;
