//! Unified error type for chatgate.

use chatgate_auth::{AuthError, VerificationError};
use chatgate_protocol::ProtocolError;
use chatgate_session::RegistryError;
use chatgate_transport::TransportError;

use crate::DirectoryError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A transport-level error (bind, upgrade, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A token failed verification.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// The auth configuration is unusable.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The session registry refused an operation or found itself
    /// corrupted. See [`GatewayError::is_fatal`].
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The identity provider could not be reached.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl GatewayError {
    /// Returns `true` if the server must stop rather than carry on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Registry(e) if e.is_fatal())
    }
}
