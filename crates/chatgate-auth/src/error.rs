//! Error types for token verification and issuance.

use chatgate_protocol::RejectReason;

/// Why a token failed verification.
///
/// Each variant maps one-to-one onto a [`RejectReason`] sent to the
/// client, so distinct failures are never collapsed into "unauthorized".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// The signature doesn't match the shared secret.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The `iss` claim isn't the configured issuer.
    #[error("invalid token issuer")]
    InvalidIssuer,

    /// The `aud` claim names no configured audience.
    #[error("invalid token audience")]
    InvalidAudience,

    /// The token's expiry is at or before the current time.
    #[error("token expired")]
    Expired,

    /// The token isn't a well-formed HS256 JWT with the required claims.
    #[error("malformed token: {0}")]
    Malformed(String),
}

impl VerificationError {
    /// The reason reported to the connecting client.
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::InvalidSignature => RejectReason::InvalidSignature,
            Self::InvalidIssuer => RejectReason::InvalidIssuer,
            Self::InvalidAudience => RejectReason::InvalidAudience,
            Self::Expired => RejectReason::Expired,
            Self::Malformed(_) => RejectReason::Malformed,
        }
    }
}

/// Errors building a verifier or minting a token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The configuration can't be used (empty secret, duplicate audiences...).
    #[error("invalid auth config: {0}")]
    InvalidConfig(String),

    /// Signing a token failed.
    #[error("token issue failed: {0}")]
    Issue(#[from] jsonwebtoken::errors::Error),
}
