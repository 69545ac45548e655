//! The credential verifier: token string in, [`Identity`] out.

use std::collections::HashSet;
use std::fmt;

use chatgate_protocol::UserId;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, get_current_timestamp, Algorithm, DecodingKey, Validation,
};
use serde::Deserialize;

use crate::{AuthConfig, AuthError, Identity, VerificationError};

/// `aud` may be a single string or an array of strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum AudienceClaim {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct VerifiedClaims {
    sub: String,
    iss: String,
    aud: AudienceClaim,
    exp: u64,
}

/// Validates bearer tokens against the process-wide [`AuthConfig`].
///
/// Holds no mutable state, so one instance behind an `Arc` serves every
/// connection attempt concurrently.
pub struct CredentialVerifier {
    key: DecodingKey,
    validation: Validation,
    config: AuthConfig,
}

impl CredentialVerifier {
    /// Builds a verifier, rejecting configs that could never verify
    /// anything.
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        config.validate()?;

        // jsonwebtoken only checks the signature here. Claims are checked
        // below, in a fixed order and with zero expiry leeway.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.leeway = 0;

        Ok(Self {
            key: DecodingKey::from_secret(&config.secret),
            validation,
            config,
        })
    }

    /// The configuration this verifier checks against.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Verifies `token` against the current wall-clock time.
    pub fn verify(&self, token: &str) -> Result<Identity, VerificationError> {
        self.verify_at(token, get_current_timestamp())
    }

    /// Verifies `token` as of `now` (unix seconds).
    ///
    /// Checks run in order and the first failure wins: signature, issuer,
    /// audience, expiry. A token is expired when `now >= exp`.
    pub fn verify_at(
        &self,
        token: &str,
        now: u64,
    ) -> Result<Identity, VerificationError> {
        let claims = decode::<VerifiedClaims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => {
                    VerificationError::InvalidSignature
                }
                _ => VerificationError::Malformed(e.to_string()),
            })?
            .claims;

        if claims.iss != self.config.issuer {
            return Err(VerificationError::InvalidIssuer);
        }

        let audience = match &claims.aud {
            AudienceClaim::One(aud) => self.config.audiences.resolve(aud),
            AudienceClaim::Many(auds) => auds
                .iter()
                .find_map(|aud| self.config.audiences.resolve(aud)),
        }
        .ok_or(VerificationError::InvalidAudience)?;

        if now >= claims.exp {
            return Err(VerificationError::Expired);
        }

        if claims.sub.is_empty() {
            return Err(VerificationError::Malformed("empty subject".into()));
        }

        Ok(Identity {
            user_id: UserId(claims.sub),
            audience,
        })
    }
}

impl fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
