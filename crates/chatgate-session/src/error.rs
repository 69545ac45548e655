//! Error types for the session layer.

use chatgate_protocol::UserId;
use chatgate_transport::ConnectionId;

/// Errors raised by the [`SessionRegistry`](crate::SessionRegistry).
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A connection with this id is already registered. The existing
    /// entry is left untouched.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// A registered connection was missing from its owner's index.
    ///
    /// This means the registry's invariants are broken. Callers must stop
    /// serving rather than continue with inconsistent session state.
    #[error("registry corrupted: {connection_id} was not indexed under {user_id}")]
    Corruption {
        connection_id: ConnectionId,
        user_id: UserId,
    },
}

impl RegistryError {
    /// Returns `true` for errors that must take the process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}
