//! Discord integration.
//!
//! `client` holds the gateway session, `api` the webhook REST calls and
//! `webhooks` the pool that decides which webhook posts what.

pub mod api;
pub mod client;
pub mod webhooks;

pub use api::{DiscordApi, WebhookApi};
pub use client::DiscordBot;
