//! Lookup hook for the identity provider.
//!
//! The gateway trusts a verified [`Identity`] on its own. The directory is
//! only asked for presentation details (a display name) to put in the
//! `Authenticated` reply, and a failed lookup never turns a verified
//! connection away.

use std::collections::HashMap;

use chatgate_auth::Identity;
use chatgate_protocol::UserId;

/// What the identity provider knows about a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: Option<String>,
}

impl UserProfile {
    /// A profile with nothing but the id.
    pub fn bare(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: None,
        }
    }
}

/// Errors a [`UserDirectory`] may report.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The provider has no record of this user.
    #[error("user {0} not found")]
    NotFound(UserId),

    /// The provider could not be reached.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to the identity provider.
///
/// # Example
///
/// ```rust
/// use chatgate::{DirectoryError, UserDirectory, UserProfile};
/// use chatgate_auth::Identity;
///
/// /// Shows every user under their id, upper-cased.
/// struct ShoutingDirectory;
///
/// impl UserDirectory for ShoutingDirectory {
///     async fn resolve_user(
///         &self,
///         identity: &Identity,
///     ) -> Result<UserProfile, DirectoryError> {
///         Ok(UserProfile {
///             user_id: identity.user_id.clone(),
///             display_name: Some(identity.user_id.as_str().to_uppercase()),
///         })
///     }
/// }
/// ```
pub trait UserDirectory: Send + Sync + 'static {
    /// Looks up the profile behind a verified identity.
    fn resolve_user(
        &self,
        identity: &Identity,
    ) -> impl std::future::Future<Output = Result<UserProfile, DirectoryError>> + Send;
}

/// Knows nobody's name; every user gets a bare profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousDirectory;

impl UserDirectory for AnonymousDirectory {
    async fn resolve_user(
        &self,
        identity: &Identity,
    ) -> Result<UserProfile, DirectoryError> {
        Ok(UserProfile::bare(identity.user_id.clone()))
    }
}

/// A fixed id → display name table.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    names: HashMap<UserId, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one user's display name.
    pub fn with_user(
        mut self,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
    ) -> Self {
        self.names.insert(user_id.into(), display_name.into());
        self
    }
}

impl UserDirectory for StaticDirectory {
    async fn resolve_user(
        &self,
        identity: &Identity,
    ) -> Result<UserProfile, DirectoryError> {
        self.names
            .get(&identity.user_id)
            .map(|name| UserProfile {
                user_id: identity.user_id.clone(),
                display_name: Some(name.clone()),
            })
            .ok_or_else(|| DirectoryError::NotFound(identity.user_id.clone()))
    }
}
