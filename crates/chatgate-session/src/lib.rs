//! Live connection registry for chatgate.
//!
//! Every authenticated real-time connection is recorded here, owned by
//! exactly one verified [`Identity`](chatgate_auth::Identity), from the
//! moment the handshake succeeds until the connection is removed
//! (disconnect, transport error, eviction or shutdown).
//!
//! # How it fits in the stack
//!
//! ```text
//! Event Router (above)   ← looks up connections to deliver events
//!     ↕
//! Session Registry (this crate)  ← who is connected, on which connections
//!     ↕
//! Connection Gateway     ← registers on accept, deregisters on close
//! ```
//!
//! A user may hold any number of simultaneous connections (a browser tab
//! and a phone, or two tabs): entries are keyed by connection id.

mod connection;
mod error;
mod registry;

pub use connection::{ConnectionHandle, Outbound, OutboundReceiver, RegisteredConnection};
pub use error::RegistryError;
pub use registry::SessionRegistry;
