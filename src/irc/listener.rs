//! The bridge's own IRC identity.
//!
//! The listener sits in every mapped channel and relays what people say
//! there into the bridge. In simple mode it also speaks for Discord users.

use serenity::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::common::error::IrcError;
use crate::common::IrcMessage;
use crate::config::types::IrcConfig;
use crate::irc::connection::{
    webirc_params, ConnectionConfig, IrcConnection, IrcHandle, IrcSink, Relay, WEBIRC_IP,
};

/// The listening connection as seen by the coordinator.
#[async_trait]
pub trait Listener: IrcSink {
    /// Dial the server and keep the connection alive in the background.
    async fn connect(&self) -> Result<(), IrcError>;
}

pub struct IrcListener {
    handle: IrcHandle,
    /// Taken on connect.
    connection: Mutex<Option<IrcConnection>>,
}

impl IrcListener {
    pub fn new(config: &IrcConfig, debug: bool, irc_tx: mpsc::UnboundedSender<IrcMessage>) -> Self {
        let connection_config = ConnectionConfig {
            server: config.server.clone(),
            nick: config.listener_name.clone(),
            user: "discord".to_string(),
            realname: "Discord bridge listener".to_string(),
            use_tls: config.use_tls,
            insecure_skip_verify: config.insecure_skip_verify,
            webirc: config
                .webirc_pass
                .as_deref()
                .map(|pass| webirc_params(pass, "discord.", WEBIRC_IP)),
            debug,
        };
        let relay = Relay {
            tx: irc_tx,
            ignore_suffix: config.suffix.clone(),
        };
        let (connection, handle) = IrcConnection::new(connection_config, Some(relay));

        Self {
            handle,
            connection: Mutex::new(Some(connection)),
        }
    }
}

#[async_trait]
impl Listener for IrcListener {
    async fn connect(&self) -> Result<(), IrcError> {
        let connection = self.connection.lock().await.take().ok_or(IrcError::AlreadyStarted)?;
        connection.start().await?;
        info!("IRC listener connected");
        Ok(())
    }
}

impl IrcSink for IrcListener {
    fn send_raw(&self, line: &str) {
        self.handle.send_raw(line);
    }

    fn join_channels(&self, channels: &[String]) {
        self.handle.join_channels(channels);
    }

    fn set_nick(&self, nick: &str) {
        self.handle.set_nick(nick);
    }

    fn set_debug_mode(&self, debug: bool) {
        self.handle.set_debug_mode(debug);
    }

    fn quit(&self) {
        self.handle.quit();
    }
}
