//! Basic type definitions for the chat server
//!
//! Provides:
//! - `ClientId`: UUID-based unique client identifier
//! - `Transport`: which wire protocol a client speaks
//! - username and room-name normalization

use uuid::Uuid;

/// Name of the room every client lands in after login
pub const LOBBY: &str = "lobby";

/// Maximum username length in characters
pub const MAX_USERNAME_LEN: usize = 32;

/// Unique client identifier (newtype pattern)
///
/// Usernames are not unique, so membership sets are keyed by this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire protocol of a connection, chosen once when the connection is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Newline-terminated text over the raw socket
    Line,
    /// JSON envelopes inside binary frames after an upgrade
    Framed,
}

impl Transport {
    /// Whether this transport understands structured events
    pub fn is_structured(self) -> bool {
        matches!(self, Transport::Framed)
    }
}

/// Clean up a user-supplied name
///
/// Trims, collapses inner whitespace to `_` and caps the length.
/// An empty result falls back to `user_NNNN`.
pub fn sanitize_username(raw: &str) -> String {
    let name: String = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_USERNAME_LEN)
        .collect();

    if name.is_empty() {
        use rand::Rng;
        format!("user_{}", rand::thread_rng().gen_range(0..10_000))
    } else {
        name
    }
}

/// Normalize a room name: trimmed, lowercased, leading `#` dropped
///
/// Returns `None` when nothing is left.
pub fn normalize_room_name(raw: &str) -> Option<String> {
    let name = raw.trim();
    let name = name.strip_prefix('#').unwrap_or(name).trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}
