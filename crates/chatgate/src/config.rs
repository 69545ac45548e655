//! Server-level settings.

use std::time::Duration;

/// Where the gateway listens and how long it waits on clients.
///
/// Token settings live separately in
/// [`AuthConfig`](chatgate_auth::AuthConfig).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Address to bind the listener to.
    pub bind_addr: String,
    /// The single path that accepts WebSocket upgrades.
    pub endpoint_path: String,
    /// How long a client without an upgrade token has to send its
    /// `Authenticate` frame.
    pub handshake_timeout: Duration,
    /// An authenticated connection that sends nothing for this long is
    /// closed.
    pub idle_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            endpoint_path: "/hubs/chat".to_string(),
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}
