use std::fmt;

use chatgate_protocol::{Audience, UserId};

/// A verified user id plus the audience it authenticated under.
///
/// Only [`CredentialVerifier`](crate::CredentialVerifier) produces these
/// from untrusted input; everything downstream of the handshake can treat
/// an `Identity` as proof that the token checked out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: UserId,
    pub audience: Audience,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, audience: Audience) -> Self {
        Self {
            user_id: user_id.into(),
            audience,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.audience)
    }
}
