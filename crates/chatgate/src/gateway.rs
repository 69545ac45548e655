//! The connection gateway: token in, registered session out.
//!
//! Every connection attempt walks one path through these states:
//!
//! ```text
//!            accept(Ok)                     close()
//! Pending ───────────────▶ Authenticated ───────────▶ Closed
//!    │
//!    │ accept(Err)
//!    ▼
//! Rejected
//! ```
//!
//! Each state is its own type ([`ConnectionAttempt`],
//! [`AuthenticatedSession`], [`Rejection`], [`ClosedSession`]), and every
//! transition consumes the state it leaves, so a rejected attempt can't be
//! registered and a closed session can't be closed twice. [`ConnectionPhase`]
//! names the states for logging and assertions.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatgate_auth::{CredentialVerifier, Identity, VerificationError};
use chatgate_protocol::{ConversationId, RejectReason, UserId};
use chatgate_session::{
    ConnectionHandle, Outbound, RegisteredConnection, RegistryError,
    SessionRegistry,
};
use chatgate_transport::ConnectionId;
use tokio::sync::mpsc;

/// Where a connection attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    /// Accepted by the transport, identity not yet established.
    Pending,
    /// Token verified and the connection registered.
    Authenticated,
    /// Turned away. Terminal.
    Rejected,
    /// Removed from the registry. Terminal.
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Authenticated => "authenticated",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why an authenticated session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the socket.
    ClientClosed,
    /// The client sent `Disconnect`.
    ClientDisconnect(String),
    /// Nothing arrived within the idle timeout.
    IdleTimeout,
    /// Reading or writing the socket failed.
    Transport(String),
    /// The server removed the connection (eviction or shutdown).
    Evicted,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::ClientDisconnect(reason) => {
                write!(f, "client disconnect: {reason}")
            }
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Evicted => f.write_str("evicted"),
        }
    }
}

/// Authenticates connections and owns their registry membership.
///
/// Cheap to clone: clones share the verifier, the registry and the
/// shut-down flag.
#[derive(Debug, Clone)]
pub struct ConnectionGateway {
    verifier: Arc<CredentialVerifier>,
    registry: Arc<SessionRegistry>,
    shut_down: Arc<AtomicBool>,
    fatal: Option<mpsc::UnboundedSender<RegistryError>>,
}

impl ConnectionGateway {
    pub fn new(
        verifier: Arc<CredentialVerifier>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            verifier,
            registry,
            shut_down: Arc::new(AtomicBool::new(false)),
            fatal: None,
        }
    }

    /// Routes fatal registry errors hit while dropping an unclosed session
    /// to `fatal`. Without it they are only logged.
    pub fn report_fatal_to(
        mut self,
        fatal: mpsc::UnboundedSender<RegistryError>,
    ) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Whether [`shutdown`](Self::shutdown) has been called. A shut-down
    /// gateway rejects every new connection as unavailable.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn verifier(&self) -> &Arc<CredentialVerifier> {
        &self.verifier
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Starts tracking a connection the transport just accepted.
    pub fn begin(&self, connection_id: ConnectionId) -> ConnectionAttempt {
        ConnectionAttempt {
            connection_id,
            gateway: self.clone(),
        }
    }

    /// Forcibly disconnects every connection of `user_id`.
    ///
    /// Each connection is deregistered at once and its writer told to send
    /// `Disconnect { reason }` and close. Returns how many connections
    /// were removed.
    ///
    /// # Errors
    /// [`RegistryError::Corruption`] if the registry is inconsistent.
    pub fn evict_user(
        &self,
        user_id: &UserId,
        reason: &str,
    ) -> Result<usize, RegistryError> {
        let mut evicted = 0;
        for conn in self.registry.connections_for(user_id) {
            if let Some(entry) = self.registry.deregister(conn.id())? {
                signal_close(&entry, reason);
                evicted += 1;
            }
        }
        tracing::info!(%user_id, evicted, reason, "user evicted");
        Ok(evicted)
    }

    /// Evicts every live connection and stops admitting new ones.
    pub fn shutdown(&self, reason: &str) -> Result<usize, RegistryError> {
        // Set before draining: an `admit` racing with the drain either
        // registers first and is drained, or sees the flag afterwards and
        // backs out.
        self.shut_down.store(true, Ordering::SeqCst);
        let drained = self.registry.drain()?;
        for entry in &drained {
            signal_close(entry, reason);
        }
        tracing::info!(closed = drained.len(), reason, "gateway shut down");
        Ok(drained.len())
    }
}

fn signal_close(entry: &RegisteredConnection, reason: &str) {
    entry.push(Outbound::Close {
        reason: reason.to_owned(),
    });
}

// ---------------------------------------------------------------------------
// Pending
// ---------------------------------------------------------------------------

/// A connection whose identity is not yet known.
#[derive(Debug)]
pub struct ConnectionAttempt {
    connection_id: ConnectionId,
    gateway: ConnectionGateway,
}

impl ConnectionAttempt {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::Pending
    }

    /// Verifies `token` against the wall clock and, if it checks out,
    /// registers the connection with `sender` as its outbound queue.
    ///
    /// `None` means the client never presented a token.
    pub fn accept(
        self,
        token: Option<&str>,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> Result<AuthenticatedSession, Rejection> {
        let verifier = Arc::clone(&self.gateway.verifier);
        self.admit(token, sender, |t| verifier.verify(t))
    }

    /// Like [`accept`](Self::accept), verifying as of `now` (unix seconds).
    pub fn accept_at(
        self,
        token: Option<&str>,
        sender: mpsc::UnboundedSender<Outbound>,
        now: u64,
    ) -> Result<AuthenticatedSession, Rejection> {
        let verifier = Arc::clone(&self.gateway.verifier);
        self.admit(token, sender, |t| verifier.verify_at(t, now))
    }

    fn admit<F>(
        self,
        token: Option<&str>,
        sender: mpsc::UnboundedSender<Outbound>,
        verify: F,
    ) -> Result<AuthenticatedSession, Rejection>
    where
        F: FnOnce(&str) -> Result<Identity, VerificationError>,
    {
        let connection_id = self.connection_id;
        let reject = |cause: RejectionCause| {
            tracing::debug!(%connection_id, %cause, "connection rejected");
            Rejection {
                connection_id,
                cause,
            }
        };

        if self.gateway.is_shut_down() {
            return Err(reject(RejectionCause::ShuttingDown));
        }
        let Some(token) = token else {
            return Err(reject(RejectionCause::MissingToken));
        };
        let identity =
            verify(token).map_err(|e| reject(RejectionCause::Verification(e)))?;

        let handle = ConnectionHandle {
            id: connection_id,
            sender,
        };
        self.gateway
            .registry
            .register(identity.clone(), handle)
            .map_err(|e| reject(RejectionCause::Registry(e)))?;

        if self.gateway.is_shut_down() {
            // Shutdown drained the registry between the check above and
            // the insert.
            self.gateway
                .registry
                .deregister(connection_id)
                .map_err(|e| reject(RejectionCause::Registry(e)))?;
            return Err(reject(RejectionCause::ShuttingDown));
        }

        tracing::info!(%connection_id, %identity, "connection authenticated");
        Ok(AuthenticatedSession {
            connection_id,
            identity,
            registry: Arc::clone(&self.gateway.registry),
            fatal: self.gateway.fatal.clone(),
            authenticated_at: Instant::now(),
            closed: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Rejected
// ---------------------------------------------------------------------------

/// What stopped a connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum RejectionCause {
    /// No token on the upgrade request and no `Authenticate` frame in time.
    #[error("missing token")]
    MissingToken,

    /// The token failed one of the verification checks.
    #[error(transparent)]
    Verification(VerificationError),

    /// The token was fine but the registry refused the connection.
    #[error(transparent)]
    Registry(RegistryError),

    /// The gateway is shutting down.
    #[error("gateway shutting down")]
    ShuttingDown,
}

/// A connection attempt that was turned away. Nothing was registered.
#[derive(Debug, thiserror::Error)]
#[error("connection {connection_id} rejected: {cause}")]
pub struct Rejection {
    connection_id: ConnectionId,
    cause: RejectionCause,
}

impl Rejection {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::Rejected
    }

    pub fn cause(&self) -> &RejectionCause {
        &self.cause
    }

    /// The reason sent to the client.
    pub fn reason(&self) -> RejectReason {
        match &self.cause {
            RejectionCause::MissingToken => RejectReason::MissingToken,
            RejectionCause::Verification(e) => e.reason(),
            RejectionCause::Registry(_) | RejectionCause::ShuttingDown => {
                RejectReason::Unavailable
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Authenticated
// ---------------------------------------------------------------------------

/// A verified, registered connection.
///
/// Leaves the registry through [`close`](Self::close). If it is dropped
/// instead (early return, panic in the handler), the drop deregisters it
/// and reports a corrupted registry to the gateway's fatal channel.
#[derive(Debug)]
pub struct AuthenticatedSession {
    connection_id: ConnectionId,
    identity: Identity,
    registry: Arc<SessionRegistry>,
    fatal: Option<mpsc::UnboundedSender<RegistryError>>,
    authenticated_at: Instant,
    closed: bool,
}

impl AuthenticatedSession {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::Authenticated
    }

    /// The live registry entry, or `None` once the connection was evicted.
    pub fn entry(&self) -> Option<Arc<RegisteredConnection>> {
        self.registry.get(self.connection_id)
    }

    /// Removes the connection from the registry.
    ///
    /// Deregistration is complete when this returns. If the connection was
    /// already evicted, that is not an error: the returned session reports
    /// `was_registered() == false`.
    ///
    /// # Errors
    /// [`RegistryError::Corruption`], which callers must treat as fatal.
    pub fn close(
        mut self,
        reason: CloseReason,
    ) -> Result<ClosedSession, RegistryError> {
        self.closed = true;
        let removed = self.registry.deregister(self.connection_id)?;

        let closed = ClosedSession {
            connection_id: self.connection_id,
            identity: self.identity.clone(),
            reason,
            was_registered: removed.is_some(),
            conversations: removed
                .map(|entry| entry.conversations())
                .unwrap_or_default(),
            lifetime: self.authenticated_at.elapsed(),
        };
        tracing::info!(
            connection_id = %closed.connection_id,
            identity = %closed.identity,
            reason = %closed.reason,
            lifetime_ms = closed.lifetime.as_millis() as u64,
            "connection closed"
        );
        Ok(closed)
    }
}

impl Drop for AuthenticatedSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.registry.deregister(self.connection_id) {
            tracing::error!(
                connection_id = %self.connection_id,
                error = %e,
                "deregistration on drop failed"
            );
            if let Some(fatal) = &self.fatal {
                let _ = fatal.send(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Closed
// ---------------------------------------------------------------------------

/// A session that has left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    connection_id: ConnectionId,
    identity: Identity,
    reason: CloseReason,
    was_registered: bool,
    conversations: Vec<ConversationId>,
    lifetime: Duration,
}

impl ClosedSession {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn phase(&self) -> ConnectionPhase {
        ConnectionPhase::Closed
    }

    pub fn reason(&self) -> &CloseReason {
        &self.reason
    }

    /// `false` if the connection had already been evicted when it closed.
    pub fn was_registered(&self) -> bool {
        self.was_registered
    }

    /// Conversations the connection had joined when it was removed.
    pub fn conversations(&self) -> &[ConversationId] {
        &self.conversations
    }

    /// Time between authentication and close.
    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }
}

// =========================================================================
// Tests
// =========================================================================
