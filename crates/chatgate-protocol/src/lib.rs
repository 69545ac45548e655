//! Wire protocol for chatgate.
//!
//! This crate defines what travels over the real-time endpoint:
//!
//! - **Identity types** ([`UserId`], [`ConversationId`], [`Audience`]) —
//!   the names the gateway uses for users and the client families that
//!   authenticate them.
//! - **Messages** ([`Envelope`], [`ClientMessage`], [`ServerMessage`],
//!   [`ChatEvent`], [`RejectReason`]) — the frames exchanged with clients.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how frames become bytes.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer knows nothing about sockets, tokens or the session
//! registry:
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Gateway (identity, routing)
//! ```

mod codec;
mod error;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use types::{
    Audience, ChatEvent, ClientMessage, ConversationId, Envelope,
    RejectReason, ServerMessage, UserId,
};
