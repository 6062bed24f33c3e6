//! A single IRC client connection.
//!
//! Each connection runs in its own task: it dials the server (optionally
//! over TLS), registers, keeps itself alive and reconnects with exponential
//! backoff. Other tasks talk to it through a cloneable [`IrcHandle`].

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::common::error::IrcError;
use crate::common::IrcMessage;
use crate::irc::codec::IrcCodec;
use crate::irc::line::Line;

/// Longest accepted inbound line, tags included.
const MAX_LINE_LENGTH: usize = 8192;

/// Address used in WEBIRC for bridged users.
pub const WEBIRC_IP: &str = "fd75:f5f5:226f::";

/// Everything needed to dial and register one connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host:port`. The port defaults to 6697 with TLS and 6667 without.
    pub server: String,
    pub nick: String,
    pub user: String,
    pub realname: String,
    pub use_tls: bool,
    /// Accept any server certificate.
    pub insecure_skip_verify: bool,
    /// WEBIRC parameters (`<password> <gateway> <hostname> <ip>`).
    pub webirc: Option<String>,
    pub debug: bool,
}

impl ConnectionConfig {
    fn address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else if self.use_tls {
            format!("{}:6697", self.server)
        } else {
            format!("{}:6667", self.server)
        }
    }

    fn host(&self) -> &str {
        self.server.split(':').next().unwrap_or(&self.server)
    }
}

/// Build the WEBIRC parameters identifying a bridged Discord user.
pub fn webirc_params(password: &str, hostname: &str, ip: &str) -> String {
    format!("{} discord {} {}", password, hostname, ip)
}

/// Where a listening connection forwards channel messages.
#[derive(Debug, Clone)]
pub struct Relay {
    pub tx: mpsc::UnboundedSender<IrcMessage>,
    /// Nicks ending with this suffix belong to the bridge and are not relayed.
    pub ignore_suffix: String,
}

/// Requests accepted by a running connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Raw(String),
    /// Replace the channel set and join it.
    Join(Vec<String>),
    Nick(String),
    Debug(bool),
    Quit,
}

/// Fire-and-forget operations on an IRC connection.
pub trait IrcSink: Send + Sync {
    fn send_raw(&self, line: &str);

    /// Join every channel in `channels`, remembering them for reconnects.
    fn join_channels(&self, channels: &[String]);

    fn privmsg(&self, target: &str, text: &str) {
        self.send_raw(&Line::with_text("PRIVMSG", &[target], text).to_string());
    }

    fn set_nick(&self, nick: &str);

    /// Log every line sent and received.
    fn set_debug_mode(&self, debug: bool);

    fn quit(&self);
}

/// Handle to a connection task.
#[derive(Debug, Clone)]
pub struct IrcHandle {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl IrcHandle {
    fn send(&self, outgoing: Outgoing) {
        if let Err(e) = self.tx.send(outgoing) {
            debug!("IRC connection is gone, dropping {:?}", e.0);
        }
    }
}

impl IrcSink for IrcHandle {
    fn send_raw(&self, line: &str) {
        self.send(Outgoing::Raw(line.to_string()));
    }

    fn join_channels(&self, channels: &[String]) {
        self.send(Outgoing::Join(channels.to_vec()));
    }

    fn set_nick(&self, nick: &str) {
        self.send(Outgoing::Nick(nick.to_string()));
    }

    fn set_debug_mode(&self, debug: bool) {
        self.send(Outgoing::Debug(debug));
    }

    fn quit(&self) {
        self.send(Outgoing::Quit);
    }
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type Transport = Framed<Box<dyn AsyncStream>, IrcCodec>;

fn frame(stream: Box<dyn AsyncStream>) -> Transport {
    Framed::new(stream, IrcCodec::new(MAX_LINE_LENGTH))
}

/// Protocol state of a connection, independent of the socket.
#[derive(Debug)]
struct ConnectionState {
    nick: String,
    channels: Vec<String>,
    debug: bool,
    registered: bool,
    relay: Option<Relay>,
}

impl ConnectionState {
    fn join_line(&self) -> Option<String> {
        if self.channels.is_empty() {
            return None;
        }
        Some(format!("JOIN {}", self.channels.join(",")))
    }

    /// React to a server line. Returns the lines to send back.
    fn handle_line(&mut self, line: &Line) -> Result<Vec<String>, IrcError> {
        let mut replies = Vec::new();

        match line.command.as_str() {
            "PING" => {
                let mut pong = line.clone();
                pong.prefix = None;
                pong.command = "PONG".to_string();
                replies.push(pong.to_string());
            }
            "001" => {
                if let Some(nick) = line.param(0) {
                    self.nick = nick.to_string();
                }
                self.registered = true;
                info!(nick = %self.nick, "Registered on IRC");
                replies.extend(self.join_line());
            }
            // ERR_NICKNAMEINUSE
            "433" => {
                self.nick.push('_');
                warn!(nick = %self.nick, "Nick in use, retrying");
                replies.push(format!("NICK {}", self.nick));
            }
            "NICK" => {
                if line.nick() == Some(self.nick.as_str()) {
                    if let Some(new_nick) = line.param(0) {
                        self.nick = new_nick.to_string();
                    }
                }
            }
            "KICK" => {
                if let (Some(channel), Some(target)) = (line.param(0), line.param(1)) {
                    if target == self.nick {
                        info!(channel, "Kicked, rejoining");
                        replies.push(format!("JOIN {}", channel));
                    }
                }
            }
            "PRIVMSG" => self.relay_privmsg(line),
            "ERROR" => {
                return Err(IrcError::Closed {
                    reason: line.param(0).unwrap_or_default().to_string(),
                });
            }
            _ => {}
        }

        Ok(replies)
    }

    fn relay_privmsg(&self, line: &Line) {
        let Some(relay) = &self.relay else {
            return;
        };
        let (Some(nick), Some(target), Some(text)) = (line.nick(), line.param(0), line.param(1)) else {
            return;
        };
        if !target.starts_with(['#', '&']) {
            return;
        }
        if nick == self.nick || (!relay.ignore_suffix.is_empty() && nick.ends_with(&relay.ignore_suffix)) {
            return;
        }

        let message = match text.strip_prefix('\u{1}') {
            Some(ctcp) => match ctcp.trim_end_matches('\u{1}').strip_prefix("ACTION ") {
                Some(action) => format!("_{}_", action),
                None => return,
            },
            None => text.to_string(),
        };

        let event = IrcMessage {
            irc_channel: target.to_string(),
            username: nick.to_string(),
            message,
        };
        if let Err(e) = relay.tx.send(event) {
            warn!("Failed to relay IRC message: {}", e);
        }
    }

    /// Apply a request while connected. Returns the lines to send.
    fn apply(&mut self, outgoing: Outgoing) -> Vec<String> {
        match outgoing {
            Outgoing::Raw(raw) => vec![raw],
            Outgoing::Join(channels) => {
                self.channels = channels;
                if self.registered {
                    self.join_line().into_iter().collect()
                } else {
                    Vec::new()
                }
            }
            Outgoing::Nick(nick) => {
                self.nick = nick;
                vec![format!("NICK {}", self.nick)]
            }
            Outgoing::Debug(debug) => {
                self.debug = debug;
                Vec::new()
            }
            Outgoing::Quit => vec!["QUIT".to_string()],
        }
    }

    /// Apply a request while disconnected. Raw lines are lost.
    fn apply_offline(&mut self, outgoing: Outgoing) {
        match outgoing {
            Outgoing::Raw(raw) => debug!(line = %raw, "Not connected, dropping line"),
            other => {
                self.apply(other);
            }
        }
    }
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Quit,
    Disconnected,
}

/// A connection and its request queue.
pub struct IrcConnection {
    config: ConnectionConfig,
    state: ConnectionState,
    outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
}

impl IrcConnection {
    /// Create a connection. Pass a [`Relay`] to forward channel messages.
    pub fn new(config: ConnectionConfig, relay: Option<Relay>) -> (Self, IrcHandle) {
        let (tx, outgoing_rx) = mpsc::unbounded_channel();
        let state = ConnectionState {
            nick: config.nick.clone(),
            channels: Vec::new(),
            debug: config.debug,
            registered: false,
            relay,
        };
        (
            Self {
                config,
                state,
                outgoing_rx,
            },
            IrcHandle { tx },
        )
    }

    /// Dial once, then keep the connection alive in a task.
    pub async fn start(self) -> Result<JoinHandle<()>, IrcError> {
        let transport = self.connect().await?;
        Ok(tokio::spawn(self.run(Some(transport))))
    }

    /// Dial and keep the connection alive in a task; the first dial may fail.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run(None))
    }

    async fn connect(&self) -> Result<Transport, IrcError> {
        let address = self.config.address();
        info!(server = %address, nick = %self.state.nick, "Connecting to IRC...");

        let tcp = TcpStream::connect(&address)
            .await
            .map_err(|source| IrcError::ConnectFailed {
                server: address.clone(),
                source,
            })?;

        if !self.config.use_tls {
            return Ok(frame(Box::new(tcp)));
        }

        let connector = TlsConnector::from(Arc::new(tls_config(self.config.insecure_skip_verify)?));
        let host = self.config.host().to_string();
        let name = ServerName::try_from(host.clone()).map_err(|_| IrcError::InvalidServerName(host))?;
        let tls = connector.connect(name, tcp).await?;
        Ok(frame(Box::new(tls)))
    }

    async fn run(mut self, mut transport: Option<Transport>) {
        fn irc_backoff() -> impl Iterator<Item = Duration> {
            backon::ExponentialBuilder::default()
                .with_min_delay(Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(300))
                .with_factor(1.5)
                .with_jitter()
                .without_max_times()
                .build()
        }

        let mut backoff = irc_backoff();

        loop {
            let connected = match transport.take() {
                Some(transport) => Ok(transport),
                None => self.connect().await,
            };

            match connected {
                Ok(transport) => {
                    backoff = irc_backoff();
                    match self.session(transport).await {
                        Ok(SessionEnd::Quit) => break,
                        Ok(SessionEnd::Disconnected) => warn!(nick = %self.state.nick, "IRC server closed the connection"),
                        Err(e) => error!(nick = %self.state.nick, "IRC connection error: {}", e),
                    }
                }
                Err(e) => error!(nick = %self.state.nick, "Failed to connect to IRC: {}", e),
            }

            let delay = backoff.next().unwrap_or(Duration::from_secs(300));
            warn!("Reconnecting to IRC in {:.1}s...", delay.as_secs_f64());
            if !self.wait_offline(delay).await {
                break;
            }
        }
        info!(nick = %self.state.nick, "IRC connection ended");
    }

    /// Sleep before reconnecting while still accepting requests.
    /// Returns `false` if the connection should stop.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                outgoing = self.outgoing_rx.recv() => match outgoing {
                    Some(Outgoing::Quit) | None => return false,
                    Some(other) => self.state.apply_offline(other),
                },
            }
        }
    }

    async fn send(&self, transport: &mut Transport, line: String) -> Result<(), IrcError> {
        let line = line.replace(['\r', '\n'], " ");
        if self.state.debug {
            debug!(nick = %self.state.nick, "--> {}", line);
        }
        transport.send(line).await?;
        Ok(())
    }

    async fn session(&mut self, mut transport: Transport) -> Result<SessionEnd, IrcError> {
        self.state.registered = false;

        if let Some(webirc) = &self.config.webirc {
            self.send(&mut transport, format!("WEBIRC {}", webirc)).await?;
        }
        self.send(&mut transport, format!("NICK {}", self.state.nick)).await?;
        let user = Line::with_text("USER", &[self.config.user.as_str(), "0", "*"], &self.config.realname);
        self.send(&mut transport, user.to_string()).await?;

        loop {
            tokio::select! {
                inbound = transport.next() => {
                    let raw = match inbound {
                        Some(raw) => raw?,
                        None => return Ok(SessionEnd::Disconnected),
                    };
                    if self.state.debug {
                        debug!(nick = %self.state.nick, "<-- {}", raw);
                    }
                    let Some(line) = Line::parse(&raw) else {
                        continue;
                    };
                    for reply in self.state.handle_line(&line)? {
                        self.send(&mut transport, reply).await?;
                    }
                }
                outgoing = self.outgoing_rx.recv() => {
                    let outgoing = outgoing.unwrap_or(Outgoing::Quit);
                    let quitting = outgoing == Outgoing::Quit;
                    for line in self.state.apply(outgoing) {
                        self.send(&mut transport, line).await?;
                    }
                    if quitting {
                        if let Err(e) = SinkExt::<String>::close(&mut transport).await {
                            debug!(nick = %self.state.nick, "Error closing IRC connection: {}", e);
                        }
                        return Ok(SessionEnd::Quit);
                    }
                }
            }
        }
    }
}

fn tls_config(insecure: bool) -> Result<rustls::ClientConfig, IrcError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
            .with_no_client_auth()
    } else {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(root_store).with_no_client_auth()
    };
    Ok(config)
}

/// Accepts any certificate. Only for testing servers with self-signed certs.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            server: "irc.example.org".to_string(),
            nick: "DiscordBot".to_string(),
            user: "discord".to_string(),
            realname: "Discord bridge".to_string(),
            use_tls: true,
            insecure_skip_verify: false,
            webirc: None,
            debug: false,
        }
    }

    fn state_with_relay() -> (ConnectionState, mpsc::UnboundedReceiver<IrcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ConnectionState {
            nick: "DiscordBot".to_string(),
            channels: vec!["#a".to_string(), "#b".to_string()],
            debug: false,
            registered: false,
            relay: Some(Relay {
                tx,
                ignore_suffix: "~d".to_string(),
            }),
        };
        (state, rx)
    }

    fn handle(state: &mut ConnectionState, raw: &str) -> Vec<String> {
        state.handle_line(&Line::parse(raw).unwrap()).unwrap()
    }

    #[test]
    fn test_address_defaults_port() {
        let mut config = config();
        assert_eq!(config.address(), "irc.example.org:6697");
        config.use_tls = false;
        assert_eq!(config.address(), "irc.example.org:6667");
        config.server = "irc.example.org:7000".to_string();
        assert_eq!(config.address(), "irc.example.org:7000");
        assert_eq!(config.host(), "irc.example.org");
    }

    #[test]
    fn test_webirc_params() {
        assert_eq!(
            webirc_params("secret", "discord.", WEBIRC_IP),
            "secret discord discord. fd75:f5f5:226f::"
        );
    }

    #[test]
    fn test_ping_pong() {
        let (mut state, _rx) = state_with_relay();
        assert_eq!(handle(&mut state, "PING :irc.example.org"), vec!["PONG :irc.example.org"]);
        assert_eq!(handle(&mut state, "PING irc.example.org"), vec!["PONG irc.example.org"]);
    }

    #[test]
    fn test_welcome_joins_channels() {
        let (mut state, _rx) = state_with_relay();
        assert_eq!(handle(&mut state, ":server 001 DiscordBot :Welcome"), vec!["JOIN #a,#b"]);
        assert!(state.registered);

        state.channels.clear();
        assert!(handle(&mut state, ":server 001 DiscordBot :Welcome").is_empty());
    }

    #[test]
    fn test_nick_in_use_appends_underscore() {
        let (mut state, _rx) = state_with_relay();
        assert_eq!(
            handle(&mut state, ":server 433 * DiscordBot :Nickname is already in use"),
            vec!["NICK DiscordBot_"]
        );
        assert_eq!(state.nick, "DiscordBot_");
    }

    #[test]
    fn test_kick_of_self_rejoins() {
        let (mut state, _rx) = state_with_relay();
        assert_eq!(handle(&mut state, ":op!o@h KICK #a DiscordBot :out"), vec!["JOIN #a"]);
        assert!(handle(&mut state, ":op!o@h KICK #a someone :out").is_empty());
    }

    #[test]
    fn test_error_closes_session() {
        let (mut state, _rx) = state_with_relay();
        let result = state.handle_line(&Line::parse("ERROR :Closing link").unwrap());
        assert!(matches!(result, Err(IrcError::Closed { ref reason }) if reason == "Closing link"));
    }

    #[test]
    fn test_relays_channel_messages() {
        let (mut state, mut rx) = state_with_relay();
        handle(&mut state, ":alice!a@h PRIVMSG #a :hello");

        assert_eq!(
            rx.try_recv().unwrap(),
            IrcMessage {
                irc_channel: "#a".to_string(),
                username: "alice".to_string(),
                message: "hello".to_string(),
            }
        );
    }

    #[test]
    fn test_relay_skips_own_and_bridged_nicks() {
        let (mut state, mut rx) = state_with_relay();
        handle(&mut state, ":DiscordBot!a@h PRIVMSG #a :echo");
        handle(&mut state, ":bob~d!a@h PRIVMSG #a :from discord");
        handle(&mut state, ":alice!a@h PRIVMSG DiscordBot :private");
        handle(&mut state, ":alice!a@h PRIVMSG #a :\u{1}VERSION\u{1}");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_relay_converts_actions() {
        let (mut state, mut rx) = state_with_relay();
        handle(&mut state, ":alice!a@h PRIVMSG #a :\u{1}ACTION waves\u{1}");

        assert_eq!(rx.try_recv().unwrap().message, "_waves_");
    }

    #[test]
    fn test_join_request_waits_for_registration() {
        let (mut state, _rx) = state_with_relay();
        assert!(state.apply(Outgoing::Join(vec!["#c".to_string()])).is_empty());
        assert_eq!(state.channels, vec!["#c"]);

        state.registered = true;
        assert_eq!(state.apply(Outgoing::Join(vec!["#c".to_string(), "#d".to_string()])), vec!["JOIN #c,#d"]);
        assert!(state.apply(Outgoing::Join(Vec::new())).is_empty());
    }

    #[test]
    fn test_offline_requests_keep_state() {
        let (mut state, _rx) = state_with_relay();
        state.apply_offline(Outgoing::Raw("PART #a".to_string()));
        state.apply_offline(Outgoing::Nick("Renamed".to_string()));
        state.apply_offline(Outgoing::Debug(true));

        assert_eq!(state.nick, "Renamed");
        assert!(state.debug);
    }

    #[tokio::test]
    async fn test_session_over_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let mut config = config();
        config.webirc = Some(webirc_params("pw", "discord.", WEBIRC_IP));

        let (mut connection, handle) = IrcConnection::new(
            config,
            Some(Relay {
                tx: relay_tx,
                ignore_suffix: "~d".to_string(),
            }),
        );
        handle.join_channels(&["#general".to_string()]);

        let session = tokio::spawn(async move { connection.session(frame(Box::new(client))).await });

        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        assert_eq!(lines.next_line().await.unwrap().unwrap(), "WEBIRC pw discord discord. fd75:f5f5:226f::");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "NICK DiscordBot");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "USER discord 0 * :Discord bridge");

        write.write_all(b":server 001 DiscordBot :Welcome\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "JOIN #general");

        write.write_all(b"PING :abc\r\n").await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PONG :abc");

        write.write_all(b":alice!a@h PRIVMSG #general :hi bridge\r\n").await.unwrap();
        let relayed = relay_rx.recv().await.unwrap();
        assert_eq!(relayed.username, "alice");
        assert_eq!(relayed.message, "hi bridge");

        // Latin-1 text neither ends the session nor blocks later lines.
        write.write_all(b":bob!b@h PRIVMSG #general :caf\xe9\r\n").await.unwrap();
        write.write_all(b":carl!c@h PRIVMSG #general :still here\r\n").await.unwrap();
        let relayed = relay_rx.recv().await.unwrap();
        assert_eq!(relayed.username, "bob");
        assert_eq!(relayed.message, "caf\u{FFFD}");
        assert_eq!(relay_rx.recv().await.unwrap().message, "still here");

        handle.privmsg("#general", "hello");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "PRIVMSG #general :hello");

        handle.quit();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "QUIT");
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Quit);
    }
}
