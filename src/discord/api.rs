//! Discord REST calls used by the webhook pool.
//!
//! Only the handful of webhook endpoints the bridge needs are exposed,
//! behind the [`WebhookApi`] trait so the pool can be driven without a
//! live Discord connection.

use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use serde::Serialize;
use serenity::async_trait;
use serenity::http::{Http, HttpBuilder};
use serenity::model::id::{ChannelId, WebhookId};
use tracing::debug;

use crate::common::error::{DiscordError, DiscordResult};

/// A webhook freshly created on Discord.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWebhook {
    pub id: String,
    pub token: String,
    pub channel_id: String,
}

/// Body of a webhook execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookParams {
    pub content: String,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub avatar_url: String,
}

/// Body of a webhook creation or edit. Empty fields are left untouched by Discord.
#[derive(Debug, Default, Serialize)]
struct WebhookEdit {
    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    avatar: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    channel_id: String,
}

/// The remote operations the webhook pool depends on.
#[async_trait]
pub trait WebhookApi: Send + Sync {
    /// Create a webhook in `channel_id`.
    async fn create_webhook(
        &self,
        channel_id: &str,
        name: &str,
        avatar: &str,
    ) -> DiscordResult<CreatedWebhook>;

    /// Post a message through a webhook.
    async fn execute_webhook(
        &self,
        webhook_id: &str,
        token: &str,
        wait: bool,
        params: &WebhookParams,
    ) -> DiscordResult<()>;

    /// Delete a webhook.
    async fn delete_webhook(&self, webhook_id: &str) -> DiscordResult<()>;

    /// Move a webhook to another channel.
    async fn edit_webhook_channel(&self, webhook_id: &str, channel_id: &str) -> DiscordResult<()>;
}

/// Build the rate-limited serenity HTTP client.
pub fn build_http(token: &str) -> DiscordResult<Http> {
    let reqwest_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .connect_timeout(Duration::from_secs(10))
        .build()?;

    Ok(HttpBuilder::new(token).client(reqwest_client).build())
}

fn snowflake(value: &str) -> DiscordResult<u64> {
    match value.parse::<u64>() {
        Ok(id) if id != 0 => Ok(id),
        _ => Err(DiscordError::InvalidId {
            value: value.to_string(),
        }),
    }
}

/// [`WebhookApi`] over serenity's [`Http`], which waits out and retries
/// rate-limited requests.
pub struct DiscordApi {
    http: Arc<Http>,
}

impl DiscordApi {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WebhookApi for DiscordApi {
    async fn create_webhook(
        &self,
        channel_id: &str,
        name: &str,
        avatar: &str,
    ) -> DiscordResult<CreatedWebhook> {
        let body = WebhookEdit {
            name: name.to_string(),
            avatar: avatar.to_string(),
            ..Default::default()
        };
        let webhook = self
            .http
            .create_webhook(ChannelId::new(snowflake(channel_id)?), &body, None)
            .await?;

        let token = webhook
            .token
            .as_ref()
            .map(|token| token.expose_secret().clone())
            .ok_or_else(|| DiscordError::MalformedResponse {
                message: format!("webhook {} has no token", webhook.id),
            })?;

        debug!(webhook_id = %webhook.id, channel_id, "Created webhook");
        Ok(CreatedWebhook {
            id: webhook.id.to_string(),
            token,
            channel_id: webhook
                .channel_id
                .map_or_else(|| channel_id.to_string(), |id| id.to_string()),
        })
    }

    async fn execute_webhook(
        &self,
        webhook_id: &str,
        token: &str,
        wait: bool,
        params: &WebhookParams,
    ) -> DiscordResult<()> {
        self.http
            .execute_webhook(WebhookId::new(snowflake(webhook_id)?), None, token, wait, Vec::new(), params)
            .await?;
        Ok(())
    }

    async fn delete_webhook(&self, webhook_id: &str) -> DiscordResult<()> {
        // A successful delete answers 204 with no body; serenity only checks the status.
        self.http
            .delete_webhook(WebhookId::new(snowflake(webhook_id)?), None)
            .await?;
        Ok(())
    }

    async fn edit_webhook_channel(&self, webhook_id: &str, channel_id: &str) -> DiscordResult<()> {
        let body = WebhookEdit {
            channel_id: channel_id.to_string(),
            ..Default::default()
        };
        let webhook = self
            .http
            .edit_webhook(WebhookId::new(snowflake(webhook_id)?), &body, None)
            .await?;

        match webhook.channel_id {
            Some(moved) if moved.to_string() != channel_id => Err(DiscordError::MalformedResponse {
                message: format!(
                    "webhook {} reported channel {} after edit to {}",
                    webhook.id, moved, channel_id
                ),
            }),
            _ => Ok(()),
        }
    }
}
