//! Discirc - IRC-Discord chat bridge
//!
//! Relays messages between IRC channels and Discord channels. IRC speakers
//! appear on Discord through pooled webhooks; Discord members appear on IRC
//! through per-user connections or the bridge's listener.

mod bridge;
mod common;
mod config;
mod discord;
mod irc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use bridge::{Bridge, BridgeHandle, ChannelBundle, Collaborators, Mapping};
use config::{env::get_config_path, load_and_validate};
use discord::api::build_http;
use discord::{DiscordApi, DiscordBot, WebhookApi};
use irc::{IrcListener, IrcManager, Listener, SpawningFactory};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = get_config_path();
    let loaded = load_and_validate(&config_path);

    // Initialize logging
    let level = match &loaded {
        Ok(config) if config.debug => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Discirc v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Loading configuration from {}...", config_path);

    let config = loaded.map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  IRC server: {}", config.irc.server);
    info!("  Listener: {}", config.irc.listener_name);
    info!("  Simple mode: {}", config.irc.simple_mode);

    // ============================================================
    // Create channels and collaborators
    // ============================================================
    let channels = ChannelBundle::new();
    let senders = channels.senders.clone();

    let webhooks: Arc<dyn WebhookApi> =
        Arc::new(DiscordApi::new(Arc::new(build_http(&config.discord.token)?)));

    let discord = DiscordBot::new(
        &config.discord.token,
        &config.discord.guild_id,
        config.irc.simple_mode,
        senders.discord_tx,
        senders.user_tx,
    )?;

    let listener: Arc<dyn Listener> =
        Arc::new(IrcListener::new(&config.irc, config.debug, senders.irc_tx));

    let users = IrcManager::new(
        listener.clone(),
        Box::new(SpawningFactory::new(config.irc.clone())),
        config.irc.simple_mode,
        &config.irc.suffix,
        config.debug,
    );

    let mut bridge = Bridge::new(
        &config,
        Collaborators {
            discord: Box::new(discord),
            listener,
            users,
            webhooks,
        },
        channels.receivers,
    )
    .context("Configuration invalid")?;

    // ============================================================
    // Connect and run
    // ============================================================
    bridge.open().await.context("Could not open bridge")?;

    let handle = channels.handle;
    let mut bridge_task = bridge.spawn();

    let reload = {
        let handle = handle.clone();
        let config_path = config_path.clone();
        tokio::spawn(async move { reload_on_hangup(handle, config_path).await })
    };

    let shutdown = tokio::select! {
        biased;
        _ = shutdown_signal() => {
            info!("Shutdown signal received - closing bridge...");
            true
        }
        _ = &mut bridge_task => false,
    };
    reload.abort();

    if shutdown {
        let timeout = Duration::from_secs(10);
        match tokio::time::timeout(timeout, handle.close()).await {
            Ok(Ok(())) => info!("Bridge closed gracefully"),
            Ok(Err(e)) => warn!("Bridge was already stopped: {}", e),
            Err(_) => warn!("Bridge shutdown timed out"),
        }
        // Give per-user connections a moment to send QUIT
        tokio::time::sleep(Duration::from_millis(500)).await;
    } else {
        error!("Bridge task ended unexpectedly");
    }

    info!("Exiting...");
    Ok(())
}

/// Re-read the configuration on SIGHUP and apply the parts that can change
/// at runtime.
#[cfg(unix)]
async fn reload_on_hangup(handle: BridgeHandle, config_path: String) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Could not install SIGHUP handler, reloading disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received - reloading {}...", config_path);

        let config = match load_and_validate(&config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("Reload failed, keeping current configuration: {}", e);
                continue;
            }
        };

        let mappings = config.channel_mappings.iter().map(Mapping::from).collect();
        let applied = match handle.set_channel_mappings(mappings).await {
            Ok(()) => handle
                .set_irc_listener_name(&config.irc.listener_name)
                .and_then(|()| handle.set_debug_mode(config.debug)),
            Err(e) => Err(e),
        };
        match applied {
            Ok(()) => info!("Configuration reloaded"),
            Err(e) => error!("Reload failed: {}", e),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_handle: BridgeHandle, _config_path: String) {
    std::future::pending::<()>().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
