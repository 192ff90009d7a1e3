//! Message protocol definitions
//!
//! `Envelope` is what the server emits, rendered either as an annotated text
//! line or as JSON. `ClientEnvelope` is what framed clients send, and
//! `Command` is the transport-agnostic form both protocols are parsed into.

use std::cell::OnceCell;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::AppError;
use crate::types::Transport;

/// Server → Client message
///
/// Tagged enum serialized as `{"type": "...", ...}` for framed clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Room message
    Msg {
        from: String,
        text: String,
        room: String,
        time: String,
    },
    /// Status notice (join/leave, errors, acknowledgments)
    System { text: String, time: String },
    /// Direct message from another user
    Dm {
        from: String,
        text: String,
        time: String,
    },
    /// Room directory snapshot
    Rooms { rooms: Vec<RoomSummary>, time: String },
    /// Member list of one room
    Users {
        room: String,
        users: Vec<String>,
        time: String,
    },
}

/// One row of the room directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSummary {
    pub name: String,
    pub count: usize,
}

/// Current local time as `HH:MM:SS`
pub fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

impl Envelope {
    pub fn msg(from: impl Into<String>, room: impl Into<String>, text: impl Into<String>) -> Self {
        Envelope::Msg {
            from: from.into(),
            text: text.into(),
            room: room.into(),
            time: timestamp(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Envelope::System {
            text: text.into(),
            time: timestamp(),
        }
    }

    pub fn dm(from: impl Into<String>, text: impl Into<String>) -> Self {
        Envelope::Dm {
            from: from.into(),
            text: text.into(),
            time: timestamp(),
        }
    }

    pub fn rooms(rooms: Vec<RoomSummary>) -> Self {
        Envelope::Rooms {
            rooms,
            time: timestamp(),
        }
    }

    pub fn users(room: impl Into<String>, users: Vec<String>) -> Self {
        Envelope::Users {
            room: room.into(),
            users,
            time: timestamp(),
        }
    }

    /// Render as a line-protocol text block (may span several lines)
    pub fn render_line(&self) -> String {
        match self {
            Envelope::Msg {
                from, text, time, ..
            } => format!("[{time}] <{from}> {text}"),
            Envelope::System { text, .. } => text.clone(),
            Envelope::Dm { from, text, .. } => format!("🔒  [DM from {from}]: {text}"),
            Envelope::Rooms { rooms, .. } => {
                let mut out = String::from("📋  Active rooms:");
                for room in rooms {
                    out.push_str(&format!("\n   #{:<15}  ({} users)", room.name, room.count));
                }
                out
            }
            Envelope::Users { room, users, .. } => {
                let mut out = format!("👥  Users in #{room}:");
                for user in users {
                    out.push_str(&format!("\n   • {user}"));
                }
                out
            }
        }
    }

    /// Render as JSON for framed clients
    pub fn render_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Convert a user-level AppError into a notice for the client
impl From<AppError> for Envelope {
    fn from(err: AppError) -> Self {
        let text = match &err {
            AppError::RoomNotFound(room) => format!("❌  Room '{room}' not found."),
            AppError::NotInRoom => "❌  You're not in a room. Use /join <room>".to_string(),
            AppError::UserNotFound(user) => format!("❌  User '{user}' not found."),
            AppError::Usage(usage) => format!("❌  Usage: {usage}"),
            AppError::UnknownCommand(cmd) => {
                format!("❌  Unknown command: {cmd}. Try /join, /rooms, /users, /msg, /quit")
            }
            AppError::AlreadyInRoom(room) => format!("❌  You're already in #{room}."),
            AppError::AlreadyLoggedIn => "❌  Already logged in.".to_string(),
            // Fatal errors are not normally reported (the connection closes)
            _ => "❌  Internal error.".to_string(),
        };
        Envelope::system(text)
    }
}

/// An envelope rendered at most once per transport
///
/// Broadcasts share one of these across all recipients.
pub struct Rendered<'a> {
    envelope: &'a Envelope,
    line: OnceCell<String>,
    json: OnceCell<Option<String>>,
}

impl<'a> Rendered<'a> {
    pub fn new(envelope: &'a Envelope) -> Self {
        Self {
            envelope,
            line: OnceCell::new(),
            json: OnceCell::new(),
        }
    }

    /// Text for a given transport, `None` if it could not be serialized
    pub fn for_transport(&self, transport: Transport) -> Option<&str> {
        match transport {
            Transport::Line => Some(self.line.get_or_init(|| self.envelope.render_line())),
            Transport::Framed => self
                .json
                .get_or_init(|| match self.envelope.render_json() {
                    Ok(json) => Some(json),
                    Err(e) => {
                        error!("Failed to serialize envelope: {}", e);
                        None
                    }
                })
                .as_deref(),
        }
    }
}

/// Kind tag of an inbound framed envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Login,
    Msg,
    Join,
    Rooms,
    Users,
    Dm,
}

/// Client → Server message on the framed protocol
///
/// Every field but `type` is optional; browsers often send them all.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: ClientKind,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// Transport-agnostic client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Name the connection (framed protocol only)
    Login(String),
    /// Message to the current room
    Say(String),
    /// Move to a room, creating it if needed
    Join(String),
    /// List rooms
    Rooms,
    /// List members of the given room, or of the current one
    Users(Option<String>),
    /// Private message by username
    Direct { target: String, text: String },
    /// Disconnect (line protocol only)
    Quit,
}

const JOIN_USAGE: &str = "/join <room>";
const MSG_USAGE: &str = "/msg <username> <message>";

impl Command {
    /// Parse one line of the line protocol
    ///
    /// Returns `Ok(None)` for blank lines.
    pub fn parse_line(line: &str) -> Result<Option<Command>, AppError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if !line.starts_with('/') {
            return Ok(Some(Command::Say(line.to_string())));
        }

        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => (cmd, rest.trim()),
            None => (line, ""),
        };

        let command = match cmd {
            "/quit" => Command::Quit,
            "/rooms" => Command::Rooms,
            "/users" => Command::Users(None),
            "/join" => {
                if rest.is_empty() {
                    return Err(AppError::Usage(JOIN_USAGE));
                }
                Command::Join(rest.to_string())
            }
            "/msg" => match rest.split_once(char::is_whitespace) {
                Some((target, text)) if !text.trim().is_empty() => Command::Direct {
                    target: target.to_string(),
                    text: text.trim().to_string(),
                },
                _ => return Err(AppError::Usage(MSG_USAGE)),
            },
            other => return Err(AppError::UnknownCommand(other.to_string())),
        };
        Ok(Some(command))
    }
}

impl TryFrom<ClientEnvelope> for Command {
    type Error = AppError;

    fn try_from(env: ClientEnvelope) -> Result<Self, Self::Error> {
        let non_empty = |field: Option<String>| field.filter(|s| !s.trim().is_empty());

        Ok(match env.kind {
            ClientKind::Login => Command::Login(env.text.unwrap_or_default()),
            ClientKind::Msg => Command::Say(
                non_empty(env.text).ok_or(AppError::Usage("{\"type\":\"msg\",\"text\":...}"))?,
            ),
            ClientKind::Join => Command::Join(
                non_empty(env.room).ok_or(AppError::Usage("{\"type\":\"join\",\"room\":...}"))?,
            ),
            ClientKind::Rooms => Command::Rooms,
            ClientKind::Users => Command::Users(non_empty(env.room)),
            ClientKind::Dm => match (non_empty(env.target), non_empty(env.text)) {
                (Some(target), Some(text)) => Command::Direct {
                    target: target.trim().to_string(),
                    text,
                },
                _ => {
                    return Err(AppError::Usage(
                        "{\"type\":\"dm\",\"target\":...,\"text\":...}",
                    ))
                }
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse_line("   ").unwrap(), None);
        assert_eq!(
            Command::parse_line("hello all").unwrap(),
            Some(Command::Say("hello all".into()))
        );
        assert_eq!(Command::parse_line("/quit").unwrap(), Some(Command::Quit));
        assert_eq!(Command::parse_line("/rooms").unwrap(), Some(Command::Rooms));
        assert_eq!(
            Command::parse_line("/users").unwrap(),
            Some(Command::Users(None))
        );
        assert_eq!(
            Command::parse_line("/join  Rust ").unwrap(),
            Some(Command::Join("Rust".into()))
        );
        assert_eq!(
            Command::parse_line("/msg bob see you at 5").unwrap(),
            Some(Command::Direct {
                target: "bob".into(),
                text: "see you at 5".into()
            })
        );
    }

    #[test]
    fn test_parse_command_errors() {
        assert!(matches!(
            Command::parse_line("/join"),
            Err(AppError::Usage(JOIN_USAGE))
        ));
        assert!(matches!(
            Command::parse_line("/msg bob"),
            Err(AppError::Usage(MSG_USAGE))
        ));
        assert!(matches!(
            Command::parse_line("/dance now"),
            Err(AppError::UnknownCommand(cmd)) if cmd == "/dance"
        ));
    }

    #[test]
    fn test_client_envelope_deserialize() {
        let json = r#"{"type": "dm", "target": "alice", "text": "hi", "room": ""}"#;
        let env: ClientEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.kind, ClientKind::Dm);
        assert_eq!(
            Command::try_from(env).unwrap(),
            Command::Direct {
                target: "alice".into(),
                text: "hi".into()
            }
        );

        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"users","room":""}"#).unwrap();
        assert_eq!(Command::try_from(env).unwrap(), Command::Users(None));

        let env: ClientEnvelope = serde_json::from_str(r#"{"type":"join"}"#).unwrap();
        assert!(matches!(Command::try_from(env), Err(AppError::Usage(_))));

        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_envelope_serialize() {
        let env = Envelope::Msg {
            from: "alice".into(),
            text: "hi".into(),
            room: "lobby".into(),
            time: "12:00:00".into(),
        };
        let json = env.render_json().unwrap();
        assert!(json.contains("\"type\":\"msg\""));
        assert!(json.contains("\"from\":\"alice\""));
        assert!(json.contains("\"room\":\"lobby\""));

        let env = Envelope::rooms(vec![RoomSummary {
            name: "lobby".into(),
            count: 2,
        }]);
        let json = env.render_json().unwrap();
        assert!(json.contains("\"rooms\":[{\"name\":\"lobby\",\"count\":2}]"));
    }

    #[test]
    fn test_render_lines() {
        let env = Envelope::Msg {
            from: "bob".into(),
            text: "yo".into(),
            room: "lobby".into(),
            time: "09:15:00".into(),
        };
        assert_eq!(env.render_line(), "[09:15:00] <bob> yo");
        assert_eq!(Envelope::dm("bob", "psst").render_line(), "🔒  [DM from bob]: psst");

        let users = Envelope::users("rust", vec!["alice".into(), "bob".into()]).render_line();
        assert_eq!(users, "👥  Users in #rust:\n   • alice\n   • bob");

        let rooms = Envelope::rooms(vec![RoomSummary {
            name: "lobby".into(),
            count: 3,
        }])
        .render_line();
        assert_eq!(rooms, "📋  Active rooms:\n   #lobby            (3 users)");
    }

    #[test]
    fn test_error_to_envelope() {
        let env: Envelope = AppError::UserNotFound("zed".into()).into();
        assert_eq!(env.render_line(), "❌  User 'zed' not found.");
    }

    #[test]
    fn test_rendered_caches_per_transport() {
        let env = Envelope::system("hello");
        let rendered = Rendered::new(&env);
        assert_eq!(rendered.for_transport(Transport::Line), Some("hello"));
        let json = rendered.for_transport(Transport::Framed).unwrap();
        assert!(json.starts_with("{\"type\":\"system\""));
        let again = rendered.for_transport(Transport::Framed).unwrap();
        assert!(std::ptr::eq(json, again));
    }
}
