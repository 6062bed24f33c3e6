//! Per-user IRC connections and the Discord -> IRC send path.
//!
//! Outside simple mode every online Discord member gets an IRC connection of
//! their own, so IRC users see them as regular nicks. Members without a
//! connection are relayed by the listener as `<name> text`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::common::{DiscordMessage, DiscordUser};
use crate::config::types::IrcConfig;
use crate::irc::connection::{webirc_params, ConnectionConfig, IrcConnection, IrcSink, WEBIRC_IP};
use crate::irc::listener::Listener;

/// Creates the IRC connection of a Discord user.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self, user: &DiscordUser, nick: &str, debug: bool) -> Arc<dyn IrcSink>;
}

/// Spawns real connections to the configured server.
pub struct SpawningFactory {
    config: IrcConfig,
}

impl SpawningFactory {
    pub fn new(config: IrcConfig) -> Self {
        Self { config }
    }
}

impl ConnectionFactory for SpawningFactory {
    fn connect(&self, user: &DiscordUser, nick: &str, debug: bool) -> Arc<dyn IrcSink> {
        let hostname = format!("{}.discord.", user.id);
        let config = ConnectionConfig {
            server: self.config.server.clone(),
            nick: nick.to_string(),
            user: "discord".to_string(),
            realname: user.username.clone(),
            use_tls: self.config.use_tls,
            insecure_skip_verify: self.config.insecure_skip_verify,
            webirc: self
                .config
                .webirc_pass
                .as_deref()
                .map(|pass| webirc_params(pass, &hostname, WEBIRC_IP)),
            debug,
        };
        let (connection, handle) = IrcConnection::new(config, None);
        connection.spawn();
        Arc::new(handle)
    }
}

/// Turn a Discord display name into a valid IRC nick with `suffix` appended.
pub fn sanitize_nick(name: &str, suffix: &str) -> String {
    let mut nick: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "[]\\`_^{|}-".contains(*c))
        .collect();

    if nick.is_empty() {
        nick.push_str("discord");
    } else if nick.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        nick.insert(0, '_');
    }

    nick.push_str(suffix);
    nick
}

struct UserConnection {
    nick: String,
    sink: Arc<dyn IrcSink>,
}

pub struct IrcManager {
    listener: Arc<dyn Listener>,
    factory: Box<dyn ConnectionFactory>,
    /// Keyed by Discord user ID.
    connections: HashMap<String, UserConnection>,
    simple_mode: bool,
    suffix: String,
    debug: bool,
}

impl IrcManager {
    pub fn new(
        listener: Arc<dyn Listener>,
        factory: Box<dyn ConnectionFactory>,
        simple_mode: bool,
        suffix: &str,
        debug: bool,
    ) -> Self {
        Self {
            listener,
            factory,
            connections: HashMap::new(),
            simple_mode,
            suffix: suffix.to_string(),
            debug,
        }
    }

    /// Create, rename or drop the connection of `user`.
    pub fn handle_user(&mut self, user: &DiscordUser, channels: &[String]) {
        if self.simple_mode || user.bot {
            return;
        }

        if !user.online {
            if let Some(connection) = self.connections.remove(&user.id) {
                info!(user_id = %user.id, nick = %connection.nick, "Discord user went offline, closing IRC connection");
                connection.sink.quit();
            }
            return;
        }

        let nick = sanitize_nick(user.display_name(), &self.suffix);
        match self.connections.get_mut(&user.id) {
            Some(connection) if connection.nick != nick => {
                debug!(user_id = %user.id, from = %connection.nick, to = %nick, "Renaming IRC connection");
                connection.sink.set_nick(&nick);
                connection.nick = nick;
            }
            Some(_) => {}
            None => {
                info!(user_id = %user.id, nick = %nick, "Opening IRC connection for Discord user");
                let sink = self.factory.connect(user, &nick, self.debug);
                if !channels.is_empty() {
                    sink.join_channels(channels);
                }
                self.connections.insert(user.id.clone(), UserConnection { nick, sink });
            }
        }
    }

    /// Send a Discord message to `irc_channel`, one PRIVMSG per line.
    pub fn send_message(&self, irc_channel: &str, message: &DiscordMessage) {
        let lines = message.content.lines().filter(|line| !line.trim().is_empty());

        match self.connections.get(&message.author.id) {
            Some(connection) => {
                for line in lines {
                    connection.sink.privmsg(irc_channel, line);
                }
            }
            None => {
                let name = message.author.display_name();
                for line in lines {
                    self.listener.privmsg(irc_channel, &format!("<{}> {}", name, line));
                }
            }
        }
    }

    /// Every per-user connection.
    pub fn connections(&self) -> impl Iterator<Item = &dyn IrcSink> {
        self.connections.values().map(|c| c.sink.as_ref())
    }

    pub fn set_debug_mode(&mut self, debug: bool) {
        self.debug = debug;
        for connection in self.connections() {
            connection.set_debug_mode(debug);
        }
    }

    /// Quit every per-user connection.
    pub fn close(&mut self) {
        info!(connections = self.connections.len(), "Closing IRC user connections");
        for (_, connection) in self.connections.drain() {
            connection.sink.quit();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use serenity::async_trait;

    use super::*;
    use crate::common::error::IrcError;

    /// Records every call made on a sink.
    #[derive(Default)]
    pub struct RecordingSink {
        pub lines: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn push(&self, line: String) {
            self.lines.lock().unwrap().push(line);
        }
    }

    impl IrcSink for RecordingSink {
        fn send_raw(&self, line: &str) {
            self.push(line.to_string());
        }

        fn join_channels(&self, channels: &[String]) {
            self.push(format!("<join> {}", channels.join(",")));
        }

        fn set_nick(&self, nick: &str) {
            self.push(format!("<nick> {}", nick));
        }

        fn set_debug_mode(&self, debug: bool) {
            self.push(format!("<debug> {}", debug));
        }

        fn quit(&self) {
            self.push("<quit>".to_string());
        }
    }

    #[async_trait]
    impl Listener for RecordingSink {
        async fn connect(&self) -> Result<(), IrcError> {
            self.push("<connect>".to_string());
            Ok(())
        }
    }

    /// Hands out recording sinks and keeps them for inspection.
    #[derive(Default, Clone)]
    pub struct RecordingFactory {
        pub sinks: Arc<Mutex<Vec<(String, Arc<RecordingSink>)>>>,
    }

    impl RecordingFactory {
        pub fn sink(&self, nick: &str) -> Arc<RecordingSink> {
            self.sinks
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == nick)
                .map(|(_, s)| s.clone())
                .unwrap()
        }

        pub fn count(&self) -> usize {
            self.sinks.lock().unwrap().len()
        }
    }

    impl ConnectionFactory for RecordingFactory {
        fn connect(&self, _user: &DiscordUser, nick: &str, _debug: bool) -> Arc<dyn IrcSink> {
            let sink = Arc::new(RecordingSink::default());
            self.sinks.lock().unwrap().push((nick.to_string(), sink.clone()));
            sink
        }
    }

    pub fn user(id: &str, name: &str, online: bool) -> DiscordUser {
        DiscordUser {
            id: id.to_string(),
            username: name.to_string(),
            nick: None,
            bot: false,
            online,
        }
    }

    fn message(author: DiscordUser, content: &str) -> DiscordMessage {
        DiscordMessage {
            channel_id: "100".to_string(),
            author,
            content: content.to_string(),
            webhook_id: None,
        }
    }

    fn manager(simple_mode: bool) -> (Arc<RecordingSink>, RecordingFactory, IrcManager) {
        let listener = Arc::new(RecordingSink::default());
        let factory = RecordingFactory::default();
        let manager = IrcManager::new(listener.clone(), Box::new(factory.clone()), simple_mode, "~d", false);
        (listener, factory, manager)
    }

    #[test]
    fn test_sanitize_nick() {
        assert_eq!(sanitize_nick("alice", "~d"), "alice~d");
        assert_eq!(sanitize_nick("Jo Smith!", "~d"), "JoSmith~d");
        assert_eq!(sanitize_nick("1337", "~d"), "_1337~d");
        assert_eq!(sanitize_nick("日本", "~d"), "discord~d");
        assert_eq!(sanitize_nick("[x]|y", ""), "[x]|y");
    }

    #[test]
    fn test_online_user_gets_connection() {
        let (_listener, factory, mut manager) = manager(false);
        manager.handle_user(&user("1", "alice", true), &["#a".to_string()]);

        assert_eq!(factory.count(), 1);
        assert_eq!(factory.sink("alice~d").lines(), vec!["<join> #a"]);

        // Repeated snapshots are idempotent
        manager.handle_user(&user("1", "alice", true), &["#a".to_string()]);
        assert_eq!(factory.count(), 1);
    }

    #[test]
    fn test_offline_user_quits() {
        let (_listener, factory, mut manager) = manager(false);
        manager.handle_user(&user("1", "alice", true), &[]);
        manager.handle_user(&user("1", "alice", false), &[]);

        assert_eq!(manager.connections().count(), 0);
        assert_eq!(factory.sink("alice~d").lines().last().unwrap(), "<quit>");
    }

    #[test]
    fn test_nick_change_renames_connection() {
        let (_listener, factory, mut manager) = manager(false);
        manager.handle_user(&user("1", "alice", true), &[]);

        let mut renamed = user("1", "alice", true);
        renamed.nick = Some("Ally".to_string());
        manager.handle_user(&renamed, &[]);

        assert_eq!(factory.count(), 1);
        assert!(factory.sink("alice~d").lines().contains(&"<nick> Ally~d".to_string()));
    }

    #[test]
    fn test_simple_mode_and_bots_get_no_connection() {
        let (_listener, factory, mut manager) = manager(true);
        manager.handle_user(&user("1", "alice", true), &[]);
        assert_eq!(factory.count(), 0);

        let (_listener, factory, mut manager) = self::manager(false);
        let mut bot = user("2", "helper", true);
        bot.bot = true;
        manager.handle_user(&bot, &[]);
        assert_eq!(factory.count(), 0);
    }

    #[test]
    fn test_message_through_user_connection() {
        let (listener, factory, mut manager) = manager(false);
        let alice = user("1", "alice", true);
        manager.handle_user(&alice, &[]);

        manager.send_message("#a", &message(alice, "line one\n\nline two"));

        assert_eq!(
            factory.sink("alice~d").lines(),
            vec!["PRIVMSG #a :line one", "PRIVMSG #a :line two"]
        );
        assert!(listener.lines().is_empty());
    }

    #[test]
    fn test_message_without_connection_uses_listener() {
        let (listener, _factory, manager) = manager(true);
        let mut bob = user("2", "bob", true);
        bob.nick = Some("Bobby".to_string());

        manager.send_message("#a", &message(bob, "hi"));

        assert_eq!(listener.lines(), vec!["PRIVMSG #a :<Bobby> hi"]);
    }

    #[test]
    fn test_close_quits_everyone() {
        let (_listener, factory, mut manager) = manager(false);
        manager.handle_user(&user("1", "alice", true), &[]);
        manager.handle_user(&user("2", "bob", true), &[]);
        manager.set_debug_mode(true);
        manager.close();

        assert_eq!(manager.connections().count(), 0);
        for nick in ["alice~d", "bob~d"] {
            let lines = factory.sink(nick).lines();
            assert!(lines.contains(&"<debug> true".to_string()));
            assert_eq!(lines.last().unwrap(), "<quit>");
        }
    }
}
