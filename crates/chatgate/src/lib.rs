//! # chatgate
//!
//! Authenticated real-time connection gateway for chat backends.
//!
//! Web and mobile clients open a WebSocket to a single endpoint and present
//! a bearer token issued by the identity provider. chatgate verifies the
//! token, records the connection under the verified identity, and from then
//! on every event on that connection is attributable to that identity.
//!
//! ```text
//! client ──token──▶ ConnectionGateway ──verify──▶ CredentialVerifier
//!                         │
//!                         └──register──▶ SessionRegistry ◀──lookup── EventRouter
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chatgate::prelude::*;
//!
//! # async fn run() -> Result<(), GatewayError> {
//! let auth = AuthConfig::new("chatapp", b"shared-secret");
//! let server = GatewayServer::builder()
//!     .bind("0.0.0.0:8080")
//!     .build(auth, AnonymousDirectory, NoopHistory)
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod directory;
mod error;
mod gateway;
mod handler;
mod server;

pub use config::GatewayConfig;
pub use directory::{
    AnonymousDirectory, DirectoryError, StaticDirectory, UserDirectory,
    UserProfile,
};
pub use error::GatewayError;
pub use gateway::{
    AuthenticatedSession, CloseReason, ClosedSession, ConnectionAttempt,
    ConnectionGateway, ConnectionPhase, Rejection, RejectionCause,
};
pub use server::{GatewayServer, GatewayServerBuilder, ShutdownHandle};

/// Everything needed to configure and run a gateway.
pub mod prelude {
    pub use crate::{
        AnonymousDirectory, CloseReason, ConnectionGateway, ConnectionPhase,
        DirectoryError, GatewayConfig, GatewayError, GatewayServer,
        GatewayServerBuilder, ShutdownHandle, StaticDirectory, UserDirectory,
        UserProfile,
    };
    pub use chatgate_auth::{
        AudienceSet, AuthConfig, CredentialVerifier, Identity, TokenIssuer,
        VerificationError,
    };
    pub use chatgate_protocol::{
        Audience, ChatEvent, ClientMessage, ConversationId, Envelope,
        RejectReason, ServerMessage, UserId,
    };
    pub use chatgate_router::{
        EventRouter, HistoryRecord, HistorySink, InMemoryHistory, NoopHistory,
        Recipient,
    };
    pub use chatgate_session::SessionRegistry;
}
