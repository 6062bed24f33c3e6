//! IRC protocol lines.

use std::fmt;

/// One parsed IRC line. Message tags are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    /// The last parameter is free text and is always written with a `:`.
    pub trailing: bool,
}

impl Line {
    pub fn new(command: &str, params: &[&str]) -> Self {
        Self {
            prefix: None,
            command: command.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            trailing: false,
        }
    }

    /// A line whose last parameter is free text, such as a message body.
    pub fn with_text(command: &str, params: &[&str], text: &str) -> Self {
        let mut line = Self::new(command, params);
        line.params.push(text.to_string());
        line.trailing = true;
        line
    }

    /// Parse a line without its CRLF terminator. Returns `None` for
    /// blank lines.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut rest = raw.trim_end_matches(['\r', '\n']);

        if rest.starts_with('@') {
            let (_, after) = rest.split_once(' ')?;
            rest = after.trim_start();
        }

        let prefix = match rest.strip_prefix(':') {
            Some(stripped) => {
                let (prefix, after) = stripped.split_once(' ')?;
                rest = after.trim_start();
                Some(prefix.to_string())
            }
            None => None,
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, after)) => (command, after),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let mut trailing = false;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(text) = rest.strip_prefix(':') {
                params.push(text.to_string());
                trailing = true;
                break;
            }
            match rest.split_once(' ') {
                Some((param, after)) => {
                    params.push(param.to_string());
                    rest = after;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            trailing,
        })
    }

    /// Nick part of the prefix (`nick!user@host`).
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split(['!', '@']).next().unwrap_or(prefix))
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        let count = self.params.len();
        for (i, param) in self.params.iter().enumerate() {
            let last = i + 1 == count;
            if last && (self.trailing || param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_privmsg() {
        let line = Line::parse(":alice!a@host PRIVMSG #general :hello there").unwrap();

        assert_eq!(line.prefix.as_deref(), Some("alice!a@host"));
        assert_eq!(line.command, "PRIVMSG");
        assert_eq!(line.params, vec!["#general", "hello there"]);
        assert_eq!(line.nick(), Some("alice"));
    }

    #[test]
    fn test_parse_without_prefix() {
        let line = Line::parse("PING :irc.example.org\r").unwrap();

        assert_eq!(line.prefix, None);
        assert_eq!(line.command, "PING");
        assert_eq!(line.param(0), Some("irc.example.org"));
        assert_eq!(line.nick(), None);
    }

    #[test]
    fn test_parse_drops_tags() {
        let line = Line::parse("@time=2024-01-01T00:00:00Z :bob PRIVMSG #a :hi").unwrap();

        assert_eq!(line.nick(), Some("bob"));
        assert_eq!(line.params, vec!["#a", "hi"]);
    }

    #[test]
    fn test_parse_middle_params() {
        let line = Line::parse(":server 001 DiscordBot :Welcome").unwrap();
        assert_eq!(line.params, vec!["DiscordBot", "Welcome"]);

        let kick = Line::parse(":op!o@h KICK #chan DiscordBot :bye").unwrap();
        assert_eq!(kick.params, vec!["#chan", "DiscordBot", "bye"]);

        let empty_trailing = Line::parse(":a PRIVMSG #c :").unwrap();
        assert_eq!(empty_trailing.params, vec!["#c", ""]);
    }

    #[test]
    fn test_parse_blank() {
        assert_eq!(Line::parse(""), None);
        assert_eq!(Line::parse("\r"), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Line::new("PRIVMSG", &["#a", "hi there"]).to_string(), "PRIVMSG #a :hi there");
        assert_eq!(Line::new("JOIN", &["#a,#b"]).to_string(), "JOIN #a,#b");
        assert_eq!(Line::new("PONG", &[":x"]).to_string(), "PONG ::x");
    }

    #[test]
    fn test_text_is_always_trailing() {
        assert_eq!(Line::with_text("PRIVMSG", &["#a"], "hi").to_string(), "PRIVMSG #a :hi");
        assert_eq!(
            Line::with_text("USER", &["discord", "0", "*"], "bridge").to_string(),
            "USER discord 0 * :bridge"
        );

        let ping = Line::parse("PING :abc").unwrap();
        assert!(ping.trailing);
        assert_eq!(ping.to_string(), "PING :abc");
        assert!(!Line::parse("PING abc").unwrap().trailing);
    }
}
