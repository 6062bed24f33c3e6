//! Pooled webhooks for posting as arbitrary IRC users.
//!
//! A [`WebhookPool`] keeps track of the webhooks the bot created and picks
//! one for every IRC message that has to be posted on Discord. Webhooks are
//! shared across all bridged channels and moved between channels on demand.
//!
//! Discord clients merge consecutive webhook posts that carry the same
//! webhook ID, even when the displayed username differs. To keep two IRC
//! speakers apart, the pool alternates between (at least) two webhooks per
//! active channel, and remembers which username last spoke through each one.
//! A webhook that stays idle for the expiry duration is flagged expired and
//! becomes the first candidate for reuse in another channel.
//!
//! Expiry timers never touch pool state. A timer only enqueues a
//! [`WebhookExpiry`] event; the owner of the pool applies it with
//! [`WebhookPool::handle_expiry`] from the same task that runs `execute`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::common::error::{DiscordResult, WebhookError};
use crate::discord::api::{CreatedWebhook, WebhookApi, WebhookParams};

/// Pool size below which expired webhooks are never deleted.
const MIN_POOL_SIZE: usize = 2;

/// Notification that a webhook's idle timer fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookExpiry {
    pub webhook_id: String,
    generation: u64,
}

/// A pooled webhook.
#[derive(Debug)]
pub struct Webhook {
    pub id: String,
    token: String,
    /// Channel the webhook currently posts to.
    pub channel_id: String,
    /// Username that last spoke through this webhook.
    pub username: String,
    /// Idle past the reuse window. Expired webhooks stay in the pool.
    pub expired: bool,
    pub last_use: Instant,
    /// Bumped on every reuse; an expiry carrying an older value is stale.
    generation: u64,
    expiry_timer: Option<JoinHandle<()>>,
}

impl Webhook {
    fn new(created: CreatedWebhook) -> Self {
        Self {
            id: created.id,
            token: created.token,
            channel_id: created.channel_id,
            username: String::new(),
            expired: false,
            last_use: Instant::now(),
            generation: 0,
            expiry_timer: None,
        }
    }

    /// Restart the idle timer from now.
    fn reset_expiry(&mut self, duration: Duration, expiry_tx: &mpsc::UnboundedSender<WebhookExpiry>) {
        self.stop_expiry();

        self.generation += 1;
        self.last_use = Instant::now();

        let deadline = self.last_use + duration;
        let expiry = WebhookExpiry {
            webhook_id: self.id.clone(),
            generation: self.generation,
        };
        let expiry_tx = expiry_tx.clone();

        self.expiry_timer = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Err(e) = expiry_tx.send(expiry) {
                debug!("Webhook expiry dropped, pool is gone: {}", e);
            }
        }));
    }

    fn stop_expiry(&mut self) {
        if let Some(timer) = self.expiry_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for Webhook {
    fn drop(&mut self) {
        self.stop_expiry();
    }
}

/// Pool of webhooks shared across all bridged channels.
///
/// The pool never deletes a webhook except for expired surplus in the
/// channel being posted to, so it can grow with the number of channels
/// that are active at the same time.
// TODO: evict webhooks that are expired and idle well past the expiry
// duration, so bursts across many channels do not leave the pool oversized.
pub struct WebhookPool {
    api: Arc<dyn WebhookApi>,
    webhooks: Vec<Webhook>,
    /// Name given to created webhooks.
    name: String,
    expiry: Duration,
    expiry_tx: mpsc::UnboundedSender<WebhookExpiry>,
}

impl WebhookPool {
    /// Create an empty pool.
    ///
    /// Returns the receiver on which expiry events arrive; they must be fed
    /// back into [`WebhookPool::handle_expiry`].
    pub fn new(
        api: Arc<dyn WebhookApi>,
        prefix: &str,
        expiry: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<WebhookExpiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let pool = Self {
            api,
            webhooks: Vec::with_capacity(MIN_POOL_SIZE),
            name: format!("{} (auto) IRC", prefix),
            expiry,
            expiry_tx,
        };
        (pool, expiry_rx)
    }

    /// Post `params` to `channel_id` as `params.username`.
    ///
    /// Picks (or creates) a webhook for the channel, stamps it with the
    /// username and restarts its idle timer, then executes it. A failed post
    /// is returned but leaves the pool untouched.
    pub async fn execute(&mut self, channel_id: &str, params: &WebhookParams) -> Result<(), WebhookError> {
        let index = self.select(channel_id, &params.username).await?;

        let webhook = &mut self.webhooks[index];
        webhook.expired = false;
        webhook.reset_expiry(self.expiry, &self.expiry_tx);
        webhook.username = params.username.clone();

        let id = webhook.id.clone();
        let token = webhook.token.clone();

        debug!(webhook_id = %id, channel_id, username = %params.username, "Executing webhook");

        self.api.execute_webhook(&id, &token, true, params).await?;
        Ok(())
    }

    /// Choose the webhook index to post through.
    async fn select(&mut self, channel_id: &str, username: &str) -> Result<usize, WebhookError> {
        let in_channel: Vec<usize> = self
            .webhooks
            .iter()
            .enumerate()
            .filter(|(_, w)| w.channel_id == channel_id)
            .map(|(i, _)| i)
            .collect();

        // Same user, same channel. Expiry does not matter: one user cannot
        // hold both an expired and a live webhook in a channel.
        if let Some(&exact) = in_channel
            .iter()
            .find(|&&i| self.webhooks[i].username == username)
        {
            let id = self.webhooks[exact].id.clone();
            debug!(webhook_id = %id, "Found perfect webhook");

            self.evict_expired(channel_id, &id).await;

            return self
                .webhooks
                .iter()
                .position(|w| w.id == id)
                .ok_or(WebhookError::Missing { id });
        }

        // The least recently used webhook of the channel was not the last
        // speaker, so posting through it keeps speakers visually apart.
        if in_channel.len() > 1 {
            if let Some(oldest) = in_channel
                .iter()
                .copied()
                .min_by_key(|&i| self.webhooks[i].last_use)
            {
                debug!(webhook_id = %self.webhooks[oldest].id, "Reusing oldest webhook of channel");
                return Ok(oldest);
            }
        }

        // Take over an expired webhook from another channel.
        if let Some(index) = self
            .webhooks
            .iter()
            .position(|w| w.expired && w.channel_id != channel_id)
        {
            debug!(webhook_id = %self.webhooks[index].id, "Found expired webhook from another channel");
            match self.reassign(index, channel_id).await {
                Ok(()) => return Ok(index),
                Err(e) => error!(
                    error = %e,
                    webhook_id = %self.webhooks[index].id,
                    "Could not move webhook, creating a new one"
                ),
            }
        }

        debug!(channel_id, "Creating a webhook");
        match self.api.create_webhook(channel_id, &self.name, "").await {
            Ok(created) => {
                info!(webhook_id = %created.id, channel_id, "Created webhook");
                self.webhooks.push(Webhook::new(created));
                Ok(self.webhooks.len() - 1)
            }
            Err(create_error) => {
                error!(error = %create_error, channel_id, "Could not create webhook, stealing one");

                if self.webhooks.is_empty() {
                    return Err(WebhookError::Exhausted {
                        channel_id: channel_id.to_string(),
                        source: create_error,
                    });
                }
                match self.reassign(0, channel_id).await {
                    Ok(()) => Ok(0),
                    Err(edit_error) => {
                        error!(error = %edit_error, "Could not move webhook after creation failure");
                        Err(WebhookError::Exhausted {
                            channel_id: channel_id.to_string(),
                            source: edit_error,
                        })
                    }
                }
            }
        }
    }

    /// Move the webhook at `index` to `channel_id`.
    async fn reassign(&mut self, index: usize, channel_id: &str) -> DiscordResult<()> {
        let webhook = &mut self.webhooks[index];
        self.api.edit_webhook_channel(&webhook.id, channel_id).await?;

        debug!(webhook_id = %webhook.id, from = %webhook.channel_id, to = channel_id, "Moved webhook");
        webhook.channel_id = channel_id.to_string();
        Ok(())
    }

    /// Delete expired webhooks of `channel_id` other than `keep`, without
    /// shrinking the pool below [`MIN_POOL_SIZE`].
    async fn evict_expired(&mut self, channel_id: &str, keep: &str) {
        let candidates: Vec<String> = self
            .webhooks
            .iter()
            .filter(|w| w.channel_id == channel_id && w.expired && w.id != keep)
            .map(|w| w.id.clone())
            .collect();

        for id in candidates {
            if self.webhooks.len() <= MIN_POOL_SIZE {
                break;
            }
            match self.api.delete_webhook(&id).await {
                Ok(()) => {
                    self.webhooks.retain(|w| w.id != id);
                    debug!(webhook_id = %id, "Removed expired webhook");
                }
                Err(e) => warn!(error = %e, webhook_id = %id, "Could not remove webhook"),
            }
        }
    }

    /// Apply an expiry event. Events from before the latest reuse are ignored.
    pub fn handle_expiry(&mut self, expiry: WebhookExpiry) {
        let Some(webhook) = self
            .webhooks
            .iter_mut()
            .find(|w| w.id == expiry.webhook_id)
        else {
            return;
        };

        if webhook.generation == expiry.generation {
            webhook.expired = true;
            webhook.expiry_timer = None;
            debug!(webhook_id = %webhook.id, "Expired webhook");
        }
    }

    /// Whether `webhook_id` belongs to the pool.
    pub fn contains(&self, webhook_id: &str) -> bool {
        self.webhooks.iter().any(|w| w.id == webhook_id)
    }

    #[cfg(test)]
    pub fn webhooks(&self) -> &[Webhook] {
        &self.webhooks
    }

    /// Stop every timer and delete every pooled webhook.
    pub async fn destroy(&mut self) {
        info!("Destroying webhook pool...");
        if self.webhooks.is_empty() {
            return;
        }

        for webhook in &mut self.webhooks {
            webhook.stop_expiry();
        }

        for webhook in std::mem::take(&mut self.webhooks) {
            if let Err(e) = self.api.delete_webhook(&webhook.id).await {
                warn!(error = %e, webhook_id = %webhook.id, "Could not remove webhook");
            }
        }
        info!("Webhook pool destroyed");
    }
}
