//! Bridge channel management.
//!
//! The coordinator owns every receiver below. Collaborator tasks only ever
//! hold senders, so all bridge state is mutated from a single task.

use tokio::sync::{mpsc, oneshot};

use crate::bridge::mapping::Mapping;
use crate::common::error::BridgeError;
use crate::common::{DiscordMessage, DiscordUser, IrcMessage};

/// Requests from the control handle.
#[derive(Debug)]
pub enum BridgeCommand {
    SetMappings {
        mappings: Vec<Mapping>,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    SetListenerName(String),
    SetDebug(bool),
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Senders handed to the IRC listener and the Discord session.
#[derive(Debug, Clone)]
pub struct InboundSenders {
    /// IRC -> Discord messages.
    pub irc_tx: mpsc::UnboundedSender<IrcMessage>,
    /// Discord -> IRC messages.
    pub discord_tx: mpsc::UnboundedSender<DiscordMessage>,
    /// Discord member snapshots. Nothing is sent here in simple mode.
    pub user_tx: mpsc::UnboundedSender<DiscordUser>,
}

/// Receivers drained by the coordinator loop.
pub struct BridgeReceivers {
    pub irc_rx: mpsc::UnboundedReceiver<IrcMessage>,
    pub discord_rx: mpsc::UnboundedReceiver<DiscordMessage>,
    pub user_rx: mpsc::UnboundedReceiver<DiscordUser>,
    pub command_rx: mpsc::UnboundedReceiver<BridgeCommand>,
}

/// Control handle of a running bridge.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::UnboundedSender<BridgeCommand>,
}

impl BridgeHandle {
    fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.command_tx.send(command).map_err(|_| BridgeError::Closed)
    }

    /// Replace the channel mappings and wait for the outcome.
    pub async fn set_channel_mappings(&self, mappings: Vec<Mapping>) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeCommand::SetMappings { mappings, reply })?;
        rx.await.map_err(|_| BridgeError::Closed)?
    }

    /// Change the nick of the IRC listener.
    pub fn set_irc_listener_name(&self, name: &str) -> Result<(), BridgeError> {
        self.send(BridgeCommand::SetListenerName(name.to_string()))
    }

    pub fn set_debug_mode(&self, debug: bool) -> Result<(), BridgeError> {
        self.send(BridgeCommand::SetDebug(debug))
    }

    /// Stop the bridge and wait until every collaborator is closed.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let (done, rx) = oneshot::channel();
        self.send(BridgeCommand::Shutdown { done })?;
        rx.await.map_err(|_| BridgeError::Closed)
    }
}

/// Bundle of all channels created for the bridge.
pub struct ChannelBundle {
    pub senders: InboundSenders,
    pub receivers: BridgeReceivers,
    pub handle: BridgeHandle,
}

impl ChannelBundle {
    pub fn new() -> Self {
        let (irc_tx, irc_rx) = mpsc::unbounded_channel();
        let (discord_tx, discord_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Self {
            senders: InboundSenders {
                irc_tx,
                discord_tx,
                user_tx,
            },
            receivers: BridgeReceivers {
                irc_rx,
                discord_rx,
                user_rx,
                command_rx,
            },
            handle: BridgeHandle { command_tx },
        }
    }
}

impl Default for ChannelBundle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_reports_closed_bridge() {
        let bundle = ChannelBundle::new();
        let handle = bundle.handle.clone();
        drop(bundle);

        assert!(matches!(handle.set_debug_mode(true), Err(BridgeError::Closed)));
        assert!(matches!(handle.close().await, Err(BridgeError::Closed)));
        assert!(matches!(
            handle.set_channel_mappings(Vec::new()).await,
            Err(BridgeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_mapping_reply_is_forwarded() {
        let mut bundle = ChannelBundle::new();
        let handle = bundle.handle.clone();

        let responder = tokio::spawn(async move {
            match bundle.receivers.command_rx.recv().await {
                Some(BridgeCommand::SetMappings { reply, .. }) => {
                    let _ = reply.send(Err(BridgeError::DuplicateMapping {
                        channel: "#a".to_string(),
                    }));
                }
                other => panic!("unexpected command {:?}", other),
            }
        });

        let result = handle.set_channel_mappings(vec![Mapping::new("#a", "1")]).await;
        assert!(matches!(result, Err(BridgeError::DuplicateMapping { .. })));
        responder.await.unwrap();
    }
}
