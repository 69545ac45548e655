//! Token minting with the shared secret.

use std::time::Duration;

use chatgate_protocol::{Audience, UserId};
use jsonwebtoken::{encode, get_current_timestamp, EncodingKey, Header};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{AuthConfig, AuthError};

/// The claims written into an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: the user id.
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Audience claim value (one of the configured audience strings).
    pub aud: String,
    /// Issued at, unix seconds.
    pub iat: u64,
    /// Expiry, unix seconds.
    pub exp: u64,
    /// Unique token id.
    pub jti: String,
}

/// Mints HS256 tokens the [`CredentialVerifier`](crate::CredentialVerifier)
/// will accept.
pub struct TokenIssuer {
    key: EncodingKey,
    config: AuthConfig,
}

impl TokenIssuer {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        config.validate()?;
        Ok(Self {
            key: EncodingKey::from_secret(&config.secret),
            config,
        })
    }

    /// Issues a token for `user_id` under `audience`, valid for `ttl`
    /// from now.
    pub fn issue(
        &self,
        user_id: &UserId,
        audience: Audience,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = get_current_timestamp();
        let expires_at = now.saturating_add(ttl.as_secs());
        let claims = self.claims_for(user_id, audience, now, expires_at);
        let token = self.sign(&claims)?;
        tracing::debug!(%user_id, %audience, exp = claims.exp, "token issued");
        Ok(token)
    }

    /// Builds the claims `issue` would sign, with explicit timestamps.
    pub fn claims_for(
        &self,
        user_id: &UserId,
        audience: Audience,
        issued_at: u64,
        expires_at: u64,
    ) -> TokenClaims {
        TokenClaims {
            sub: user_id.to_string(),
            iss: self.config.issuer.clone(),
            aud: self.config.audiences.claim_for(audience).to_owned(),
            iat: issued_at,
            exp: expires_at,
            jti: generate_jti(),
        }
    }

    /// Signs arbitrary claims.
    pub fn sign(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        Ok(encode(&Header::default(), claims, &self.key)?)
    }
}

/// 128 random bits as 32 lowercase hex characters.
fn generate_jti() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
