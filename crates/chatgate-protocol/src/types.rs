//! Core protocol types for chatgate's wire format.
//!
//! Everything here is serialized to JSON and sent over the real-time
//! endpoint. Enums are internally tagged (`{ "type": "SendMessage", ... }`)
//! so JavaScript and Swift/Kotlin clients can switch on a single field.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A stable user identifier, as issued by the identity provider.
///
/// Serialized as a plain string (`"alice"`, or a GUID in production).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Creates a user id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// Identifier of a conversation (a chat thread between two or more users).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C-{}", self.0)
    }
}

/// The client family a token was issued to.
///
/// Tokens carry an audience claim; the gateway only admits the two
/// audiences it is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// Browser clients.
    Web,
    /// Native mobile apps.
    Mobile,
}

impl Audience {
    /// Both audiences, in a fixed order.
    pub const ALL: [Audience; 2] = [Audience::Web, Audience::Mobile];

    /// The lowercase name used in configuration and on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "web" => Ok(Self::Web),
            "mobile" => Ok(Self::Mobile),
            other => Err(format!("unknown audience {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The top-level frame. Every message on the wire is an `Envelope`.
///
/// ```text
/// { "seq": 42, "timestamp": 15000, "payload": { "type": "...", ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Per-direction, per-connection sequence number. Starts at 0 for the
    /// handshake reply and increments by one per frame.
    pub seq: u64,

    /// Milliseconds since the sending side's connection started.
    pub timestamp: u64,

    /// The message itself.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload.
    pub fn new(seq: u64, timestamp: u64, payload: T) -> Self {
        Self {
            seq,
            timestamp,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Frames a client sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Presents a bearer token. Only valid as the first frame, and only
    /// when the upgrade request itself carried no token.
    Authenticate { token: String },

    /// Keep-alive. Echoed back in [`ServerMessage::HeartbeatAck`].
    Heartbeat { client_time: u64 },

    /// Start receiving events for a conversation on this connection.
    JoinConversation { conversation_id: ConversationId },

    /// Stop receiving events for a conversation on this connection.
    LeaveConversation { conversation_id: ConversationId },

    /// Post a message to every member of a conversation.
    SendMessage {
        conversation_id: ConversationId,
        body: String,
    },

    /// Send a message straight to every live connection of one user.
    SendDirect { to: UserId, body: String },

    /// The client is going away.
    Disconnect { reason: String },
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Why a connection attempt was turned down.
///
/// One variant per verification failure so clients can tell an expired
/// token (refresh it) from a wrong audience (wrong app build).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// Signature does not match the shared secret.
    InvalidSignature,
    /// Token was issued by someone else.
    InvalidIssuer,
    /// Token was issued for a client family the gateway doesn't serve.
    InvalidAudience,
    /// Token expiry is now or in the past.
    Expired,
    /// Not a well-formed signed token.
    Malformed,
    /// No token arrived before the handshake deadline.
    MissingToken,
    /// The token checked out but the gateway could not admit the
    /// connection. Retrying later may succeed.
    Unavailable,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::InvalidSignature => "invalid signature",
            Self::InvalidIssuer => "invalid issuer",
            Self::InvalidAudience => "invalid audience",
            Self::Expired => "token expired",
            Self::Malformed => "malformed token",
            Self::MissingToken => "missing token",
            Self::Unavailable => "gateway unavailable",
        };
        f.write_str(text)
    }
}

/// Real-time events pushed to connections by the event router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatEvent {
    /// A user started listening to a conversation.
    UserJoined {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// A user stopped listening to a conversation (or disconnected).
    UserLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    /// A message posted to a conversation.
    MessageSent {
        conversation_id: ConversationId,
        from: UserId,
        body: String,
        /// Unix milliseconds, stamped by the gateway.
        sent_at: u64,
    },

    /// A message sent directly from one user to another.
    DirectMessage {
        from: UserId,
        to: UserId,
        body: String,
        /// Unix milliseconds, stamped by the gateway.
        sent_at: u64,
    },
}

impl ChatEvent {
    /// The conversation this event belongs to, if any.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::UserJoined { conversation_id, .. }
            | Self::UserLeft { conversation_id, .. }
            | Self::MessageSent { conversation_id, .. } => {
                Some(*conversation_id)
            }
            Self::DirectMessage { .. } => None,
        }
    }
}

/// Frames the gateway sends to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The token verified and the connection is live.
    Authenticated {
        connection_id: u64,
        user_id: UserId,
        audience: Audience,
        /// Filled in from the identity provider when it knows the user.
        display_name: Option<String>,
    },

    /// The connection attempt was turned down. Always followed by a close.
    Rejected { reason: RejectReason },

    /// Reply to [`ClientMessage::Heartbeat`].
    HeartbeatAck { client_time: u64, server_time: u64 },

    /// A routed chat event.
    Event { event: ChatEvent },

    /// A request could not be served. HTTP-style codes (400, 403, ...).
    Error { code: u16, message: String },

    /// The server is closing this connection (eviction, shutdown).
    Disconnect { reason: String },
}
