//! Token validation parameters.
//!
//! Loaded once at process start and never mutated afterwards. There is
//! deliberately no clock-skew setting: expiry is checked with zero
//! tolerance.

use std::fmt;

use chatgate_protocol::Audience;

/// The two audience strings the gateway admits, one per client family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudienceSet {
    /// Audience claim carried by tokens issued to browser clients.
    pub web: String,
    /// Audience claim carried by tokens issued to mobile apps.
    pub mobile: String,
}

impl AudienceSet {
    /// Maps an `aud` claim value onto the client family it names.
    pub fn resolve(&self, claim: &str) -> Option<Audience> {
        if claim == self.web {
            Some(Audience::Web)
        } else if claim == self.mobile {
            Some(Audience::Mobile)
        } else {
            None
        }
    }

    /// The configured claim value for an audience.
    pub fn claim_for(&self, audience: Audience) -> &str {
        match audience {
            Audience::Web => &self.web,
            Audience::Mobile => &self.mobile,
        }
    }
}

impl Default for AudienceSet {
    fn default() -> Self {
        Self {
            web: Audience::Web.as_str().to_owned(),
            mobile: Audience::Mobile.as_str().to_owned(),
        }
    }
}

/// Issuer, audience allow-list and shared HS256 secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub issuer: String,
    pub audiences: AudienceSet,
    pub secret: Vec<u8>,
}

impl AuthConfig {
    /// Creates a config with the default `web`/`mobile` audiences.
    pub fn new(issuer: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            issuer: issuer.into(),
            audiences: AudienceSet::default(),
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Replaces the audience allow-list.
    pub fn with_audiences(mut self, audiences: AudienceSet) -> Self {
        self.audiences = audiences;
        self
    }

    /// Checks the config can actually verify tokens.
    pub fn validate(&self) -> Result<(), crate::AuthError> {
        if self.secret.is_empty() {
            return Err(crate::AuthError::InvalidConfig(
                "signing secret must not be empty".into(),
            ));
        }
        if self.issuer.is_empty() {
            return Err(crate::AuthError::InvalidConfig(
                "issuer must not be empty".into(),
            ));
        }
        if self.audiences.web.is_empty() || self.audiences.mobile.is_empty() {
            return Err(crate::AuthError::InvalidConfig(
                "audiences must not be empty".into(),
            ));
        }
        if self.audiences.web == self.audiences.mobile {
            return Err(crate::AuthError::InvalidConfig(format!(
                "web and mobile audiences must differ (both {:?})",
                self.audiences.web
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("audiences", &self.audiences)
            .field("secret", &"<redacted>")
            .finish()
    }
}
