//! Bearer token verification for chatgate.
//!
//! The identity provider issues HS256-signed tokens to two client families
//! (web and mobile). This crate turns such a token back into an
//! [`Identity`], or tells the caller precisely why it can't:
//!
//! 1. signature → [`VerificationError::InvalidSignature`]
//! 2. issuer → [`VerificationError::InvalidIssuer`]
//! 3. audience → [`VerificationError::InvalidAudience`]
//! 4. expiry, zero tolerance → [`VerificationError::Expired`]
//!
//! The [`CredentialVerifier`] is immutable once built and meant to be
//! shared by every connection task behind an `Arc`.
//!
//! [`TokenIssuer`] mints tokens with the same secret. Production tokens
//! come from the identity provider; the issuer exists for tests and local
//! development.

mod config;
mod error;
mod identity;
mod issuer;
mod verifier;

pub use config::{AudienceSet, AuthConfig};
pub use error::{AuthError, VerificationError};
pub use identity::Identity;
pub use issuer::{TokenClaims, TokenIssuer};
pub use verifier::CredentialVerifier;
