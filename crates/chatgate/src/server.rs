//! `GatewayServer` builder and server loop.
//!
//! This is the entry point for running a chatgate server. It ties together
//! all the layers: transport → protocol → gateway → registry → router.

use std::sync::Arc;
use std::time::Duration;

use chatgate_auth::{AuthConfig, CredentialVerifier};
use chatgate_protocol::{Codec, JsonCodec};
use chatgate_router::{EventRouter, HistorySink};
use chatgate_session::{RegistryError, SessionRegistry};
use chatgate_transport::{Transport, WebSocketTransport};
use tokio::sync::{mpsc, watch};

use crate::handler::handle_connection;
use crate::{ConnectionGateway, GatewayConfig, GatewayError, UserDirectory};

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. Nothing in
/// here needs a lock: the registry shards its own state and everything
/// else is read-only.
pub(crate) struct ServerState<H: HistorySink, D: UserDirectory, C: Codec> {
    pub(crate) gateway: ConnectionGateway,
    pub(crate) router: EventRouter<H>,
    pub(crate) directory: D,
    pub(crate) codec: C,
    pub(crate) config: GatewayConfig,
}

/// Builder for configuring and starting a chatgate server.
///
/// # Example
///
/// ```rust,ignore
/// use chatgate::prelude::*;
///
/// let server = GatewayServer::builder()
///     .bind("0.0.0.0:8080")
///     .endpoint_path("/hubs/chat")
///     .build(AuthConfig::new("chatapp", secret), AnonymousDirectory, NoopHistory)
///     .await?;
/// server.run().await
/// ```
pub struct GatewayServerBuilder {
    config: GatewayConfig,
}

impl GatewayServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
        }
    }

    /// Replaces all server settings at once.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Sets the path clients upgrade on.
    pub fn endpoint_path(mut self, path: &str) -> Self {
        self.config.endpoint_path = path.to_string();
        self
    }

    /// Sets how long a client may take to present its token.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Sets how long an authenticated connection may stay silent.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Builds the verifier, registry and router, and binds the listener.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`.
    ///
    /// # Errors
    /// [`GatewayError::Auth`] for an unusable `auth` config,
    /// [`GatewayError::Transport`] if the address can't be bound.
    pub async fn build<D, H>(
        self,
        auth: AuthConfig,
        directory: D,
        history: H,
    ) -> Result<GatewayServer<H, D, JsonCodec>, GatewayError>
    where
        D: UserDirectory,
        H: HistorySink,
    {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let verifier = Arc::new(CredentialVerifier::new(auth)?);
        let registry = Arc::new(SessionRegistry::new());
        let gateway = ConnectionGateway::new(verifier, Arc::clone(&registry))
            .report_fatal_to(fatal_tx.clone());
        let router = EventRouter::new(registry, Arc::new(history));

        let transport = WebSocketTransport::bind(
            &self.config.bind_addr,
            &self.config.endpoint_path,
        )
        .await?;

        let state = Arc::new(ServerState {
            gateway,
            router,
            directory,
            codec: JsonCodec,
            config: self.config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(GatewayServer {
            transport,
            state,
            fatal_tx,
            fatal_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }
}

impl Default for GatewayServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Stops a running [`GatewayServer`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Asks the server to evict every connection and return from `run`.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// A bound chatgate server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct GatewayServer<H: HistorySink, D: UserDirectory, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<H, D, C>>,
    fatal_tx: mpsc::UnboundedSender<RegistryError>,
    fatal_rx: mpsc::UnboundedReceiver<RegistryError>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer<chatgate_router::NoopHistory, crate::AnonymousDirectory, JsonCodec> {
    /// Creates a new builder.
    pub fn builder() -> GatewayServerBuilder {
        GatewayServerBuilder::new()
    }
}

impl<H, D, C> GatewayServer<H, D, C>
where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// The gateway, for out-of-band eviction.
    pub fn gateway(&self) -> ConnectionGateway {
        self.state.gateway.clone()
    }

    /// The router, for pushing server-originated events.
    pub fn router(&self) -> EventRouter<H> {
        self.state.router.clone()
    }

    /// The server settings in effect.
    pub fn config(&self) -> &GatewayConfig {
        &self.state.config
    }

    /// A handle that stops [`run`](Self::run) from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Runs the server accept loop.
    ///
    /// Accepts incoming connections and spawns a handler task for each.
    /// Returns `Ok(())` after a shutdown request, once every connection has
    /// been told to close.
    ///
    /// # Errors
    /// [`GatewayError::Registry`] when a handler found the session registry
    /// corrupted. The process should exit.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        tracing::info!(
            endpoint = %self.state.config.endpoint_path,
            "chatgate server running"
        );

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(incoming) => {
                        let state = Arc::clone(&self.state);
                        let fatal = self.fatal_tx.clone();
                        tokio::spawn(async move {
                            match handle_connection(incoming, state).await {
                                Ok(()) => {}
                                Err(GatewayError::Registry(e)) if e.is_fatal() => {
                                    let _ = fatal.send(e);
                                }
                                Err(e) => {
                                    tracing::debug!(
                                        error = %e,
                                        "connection ended with error"
                                    );
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },

                Some(err) = self.fatal_rx.recv() => {
                    tracing::error!(error = %err, "fatal registry error, stopping");
                    return Err(err.into());
                }

                Ok(()) = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        self.state.gateway.shutdown("server shutting down")?;
                        self.transport.shutdown().await?;
                        return Ok(());
                    }
                }
            }
        }
    }
}
