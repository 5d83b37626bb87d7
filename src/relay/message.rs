//! Relay line grammar and body escaping.
//!
//! Client to server:  `/command body` or a bare body (implicit `message`).
//! Server to client:  `/command [username] body`.
//!
//! Lines are terminated by `\n` on the wire, but everything here works on
//! the content without the terminator. The newline is added and stripped by
//! [`LineCodec`](super::codec::LineCodec).
use std::fmt;

/// Characters that would break the delimiter grammar if sent raw, paired
/// with their escaped form. `%` must stay first so that escapes introduced
/// for the other five are not escaped again.
const ESCAPES: [(&str, &str); 6] = [
    ("%", "%25"),
    (":", "%3A"),
    ("[", "%5B"),
    ("]", "%5D"),
    (",", "%2C"),
    ("\"", "%22"),
];

/// Escape a field for the wire. Percent first, then the structural five.
pub fn escape(value: &str) -> String {
    ESCAPES
        .iter()
        .fold(value.to_owned(), |acc, (raw, escaped)| acc.replace(raw, escaped))
}

/// Reverse of [`escape`]. The structural five first, `%25` last.
pub fn unescape(value: &str) -> String {
    ESCAPES
        .iter()
        .rev()
        .fold(value.to_owned(), |acc, (raw, escaped)| acc.replace(escaped, raw))
}

/// A decoded protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    /// Command name (`message`, `enter`, ...). Empty for a malformed line.
    pub name: String,
    /// Originating username. Only present on server-to-client relays.
    pub username: Option<String>,
    pub body: String,
}

impl Command {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            username: None,
            body: body.into(),
        }
    }

    /// Decode a line sent by a client.
    ///
    /// A line without a leading `/` is a plain chat message; the whole line
    /// becomes the body of an implicit `message` command.
    pub fn parse_client(input: &str) -> Self {
        let input = input.trim_end_matches(['\r', '\n']);

        let Some(rest) = input.strip_prefix('/') else {
            return Self::new("message", unescape(input));
        };

        let (name, body) = split_name(rest);
        Self::new(unescape(name), unescape(body.trim_start()))
    }

    /// Decode a line relayed by the server.
    ///
    /// Anything that does not start with `/` decodes to an empty command,
    /// which callers drop.
    pub fn parse_server(input: &str) -> Self {
        let input = input.trim_end_matches(['\r', '\n']);

        let Some(rest) = input.strip_prefix('/') else {
            return Self::default();
        };

        let (name, mut rest) = split_name(rest);

        // At most one separator before an optional `[username]`.
        if let Some(stripped) = rest.strip_prefix(char::is_whitespace) {
            rest = stripped;
        }

        let mut username = None;
        if let Some(tagged) = rest.strip_prefix('[') {
            if let Some(end) = tagged.find(']') {
                username = Some(unescape(&tagged[..end]));
                rest = &tagged[end + 1..];
            }
        }

        Self {
            name: unescape(name),
            username,
            body: unescape(rest.trim_start()),
        }
    }

    /// Serialize as a client line: `/name body`.
    pub fn to_client_line(&self) -> String {
        format!("/{} {}", escape(&self.name), escape(&self.body))
    }

    /// Serialize as a server relay: `/name [username] body`, or the short
    /// `/name body` form when no username is attached.
    pub fn to_server_line(&self) -> String {
        let mut out = format!("/{}", escape(&self.name));
        if let Some(ref username) = self.username {
            out.push_str(" [");
            out.push_str(&escape(username));
            out.push(']');
            out.push(' ');
            out.push_str(&escape(&self.body));
        } else if !self.body.is_empty() {
            out.push(' ');
            out.push_str(&escape(&self.body));
        }
        out
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_server_line())
    }
}

/// Split `name rest` at the first whitespace character.
fn split_name(input: &str) -> (&str, &str) {
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], &input[idx..]),
        None => (input, ""),
    }
}

/// Events the server emits. Every relayed line and every logged action
/// carries one of these as its command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Ready,
    Connect,
    Disconnect,
    Enter,
    Leave,
    Message,
    Ignoring,
    Unrecognized,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Message => "message",
            Self::Ignoring => "ignoring",
            Self::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a client asked for, decoded from a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Handshake: claim a username.
    User(String),
    Message(String),
    Enter(String),
    Leave,
    Ignore(String),
    Disconnect,
    Unrecognized(String),
    /// `/` with no name. Dropped.
    Empty,
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        let Command { name, body, .. } = command;
        match name.as_str() {
            "" => Self::Empty,
            "user" => Self::User(body),
            "message" => Self::Message(body),
            "enter" => Self::Enter(body),
            "leave" => Self::Leave,
            "ignore" => Self::Ignore(body),
            "disconnect" => Self::Disconnect,
            _ => Self::Unrecognized(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Escaping ─────────────────────────────────────────────────

    #[test]
    fn escape_each_structural_char() {
        assert_eq!(escape("a:b"), "a%3Ab");
        assert_eq!(escape("[x]"), "%5Bx%5D");
        assert_eq!(escape("1,2"), "1%2C2");
        assert_eq!(escape("say \"hi\""), "say %22hi%22");
        assert_eq!(escape("100%"), "100%25");
    }

    #[test]
    fn escape_percent_before_the_rest() {
        // A literal `%` next to `:` must not turn into a double escape.
        assert_eq!(escape("%:"), "%25%3A");
    }

    #[test]
    fn unescape_percent_last() {
        // `%253A` is an escaped literal "%3A", not an escaped colon.
        assert_eq!(unescape("%253A"), "%3A");
        assert_eq!(unescape("%25%3A"), "%:");
    }

    #[test]
    fn escape_roundtrip_mixed_bodies() {
        for body in [
            "",
            "plain text",
            "%",
            "%%",
            "%25",
            "%3A",
            "50%: [a,b] \"quoted\"",
            "]%[%,%\"%:",
            "%2C literally",
        ] {
            assert_eq!(unescape(&escape(body)), body, "body {body:?}");
        }
    }

    #[test]
    fn escaped_text_has_no_structural_chars() {
        let escaped = escape("a:b[c]d,e\"f");
        assert!(!escaped.contains([':', '[', ']', ',', '"']));
    }

    // ── Client lines ─────────────────────────────────────────────

    #[test]
    fn parse_client_command_with_body() {
        let cmd = Command::parse_client("/enter kitchen");
        assert_eq!(cmd, Command::new("enter", "kitchen"));
    }

    #[test]
    fn parse_client_command_without_body() {
        assert_eq!(Command::parse_client("/leave"), Command::new("leave", ""));
    }

    #[test]
    fn parse_client_collapses_separator_whitespace() {
        let cmd = Command::parse_client("/ignore    bob");
        assert_eq!(cmd.body, "bob");
    }

    #[test]
    fn parse_client_bare_line_is_message() {
        let cmd = Command::parse_client("hello there");
        assert_eq!(cmd, Command::new("message", "hello there"));
    }

    #[test]
    fn parse_client_unescapes_body() {
        let cmd = Command::parse_client("/message 50%25 off%3A %5Bsale%5D");
        assert_eq!(cmd.body, "50% off: [sale]");
    }

    #[test]
    fn parse_client_bare_slash_is_empty() {
        assert_eq!(Command::parse_client("/").name, "");
        assert_eq!(Command::parse_client("/ stray").name, "");
    }

    #[test]
    fn parse_client_strips_line_terminator() {
        assert_eq!(Command::parse_client("/leave\r\n"), Command::new("leave", ""));
    }

    // ── Server lines ─────────────────────────────────────────────

    #[test]
    fn parse_server_relay_with_username() {
        let cmd = Command::parse_server("/message [alice] hi there");
        assert_eq!(cmd.name, "message");
        assert_eq!(cmd.username.as_deref(), Some("alice"));
        assert_eq!(cmd.body, "hi there");
    }

    #[test]
    fn parse_server_bare_prompt() {
        let cmd = Command::parse_server("/ready");
        assert_eq!(cmd.name, "ready");
        assert_eq!(cmd.username, None);
        assert_eq!(cmd.body, "");
    }

    #[test]
    fn parse_server_private_confirmation() {
        let cmd = Command::parse_server("/ignoring bob");
        assert_eq!(cmd.name, "ignoring");
        assert_eq!(cmd.username, None);
        assert_eq!(cmd.body, "bob");
    }

    #[test]
    fn parse_server_empty_body_after_username() {
        let cmd = Command::parse_server("/connect [alice] ");
        assert_eq!(cmd.username.as_deref(), Some("alice"));
        assert_eq!(cmd.body, "");
    }

    #[test]
    fn parse_server_malformed_is_empty() {
        assert_eq!(Command::parse_server("no slash here"), Command::default());
        assert_eq!(Command::parse_server(""), Command::default());
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn client_line_escapes_fields() {
        let cmd = Command::new("message", "a:b");
        assert_eq!(cmd.to_client_line(), "/message a%3Ab");
    }

    #[test]
    fn server_line_with_username() {
        let cmd = Command {
            name: "message".into(),
            username: Some("alice".into()),
            body: "hi".into(),
        };
        assert_eq!(cmd.to_server_line(), "/message [alice] hi");
    }

    #[test]
    fn server_line_without_username_or_body() {
        assert_eq!(Command::new("ready", "").to_server_line(), "/ready");
        assert_eq!(
            Command::new("ignoring", "bob").to_server_line(),
            "/ignoring bob"
        );
    }

    #[test]
    fn server_line_survives_hostile_username_and_body() {
        let cmd = Command {
            name: "message".into(),
            username: Some("[evil]".into()),
            body: "] [x] %5B".into(),
        };
        assert_eq!(Command::parse_server(&cmd.to_server_line()), cmd);
    }

    #[test]
    fn client_line_survives_structural_body() {
        let cmd = Command::new("message", "%: [a], \"b\"");
        assert_eq!(Command::parse_client(&cmd.to_client_line()), cmd);
    }

    // ── Requests ─────────────────────────────────────────────────

    #[test]
    fn request_mapping_is_total() {
        assert_eq!(
            Request::from(Command::new("user", "alice")),
            Request::User("alice".into())
        );
        assert_eq!(Request::from(Command::new("leave", "x")), Request::Leave);
        assert_eq!(Request::from(Command::new("disconnect", "")), Request::Disconnect);
        assert_eq!(Request::from(Command::new("", "")), Request::Empty);
        assert_eq!(
            Request::from(Command::new("dance", "now")),
            Request::Unrecognized("dance".into())
        );
    }
}
