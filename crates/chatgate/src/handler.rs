//! Per-connection handler: upgrade, authenticate, route.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Upgrade the HTTP request (handshake timeout) → token from header/query, if any
//!   2. No token yet → wait for an `Authenticate` frame (handshake timeout)
//!   3. Accept or reject through the gateway → `Authenticated` / `Rejected`
//!   4. Spawn the writer draining the connection's outbound queue
//!   5. Loop: receive envelopes → dispatch client messages
//!   6. Close the session (deregister), then tell conversations it left

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chatgate_protocol::{
    ChatEvent, ClientMessage, Codec, Envelope, ServerMessage,
};
use chatgate_router::{HistorySink, Recipient};
use chatgate_session::{Outbound, OutboundReceiver, RegisteredConnection};
use chatgate_transport::{Connection, WebSocketConnection, WebSocketUpgrade};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::gateway::{AuthenticatedSession, CloseReason};
use crate::server::ServerState;
use crate::{GatewayError, UserDirectory, UserProfile};

/// The sending side of one connection.
///
/// Shared by the reader (replies) and the writer task (routed events).
/// The sequence lock is held through the send so frames leave in `seq`
/// order. `closed_by_server` fires once the writer has sent the close
/// frame for an eviction.
struct Outbox {
    conn: WebSocketConnection,
    seq: Mutex<u64>,
    started: Instant,
    closed_by_server: Notify,
}

impl Outbox {
    fn new(conn: WebSocketConnection) -> Self {
        Self {
            conn,
            seq: Mutex::new(0),
            started: Instant::now(),
            closed_by_server: Notify::new(),
        }
    }

    /// Milliseconds since the connection was accepted.
    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn send(
        &self,
        codec: &impl Codec,
        msg: ServerMessage,
    ) -> Result<(), GatewayError> {
        let mut seq = self.seq.lock().await;
        let envelope = Envelope::new(next_seq(&mut seq), self.elapsed_ms(), msg);
        let bytes = codec.encode(&envelope)?;
        self.conn.send(&bytes).await?;
        Ok(())
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<H, D, C>(
    incoming: WebSocketUpgrade,
    state: Arc<ServerState<H, D, C>>,
) -> Result<(), GatewayError>
where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    let upgraded =
        tokio::time::timeout(state.config.handshake_timeout, incoming.upgrade())
            .await;
    let (conn, request) = match upgraded {
        Ok(result) => result?,
        Err(_) => {
            tracing::debug!("upgrade request not received in time");
            return Ok(());
        }
    };
    let conn_id = conn.id();
    tracing::debug!(%conn_id, peer = ?request.peer_addr, "handling new connection");
    let outbox = Arc::new(Outbox::new(conn));

    // --- Step 1: Token ---
    let token = match request.bearer_token {
        Some(token) => Some(token),
        None => match await_token(&outbox, &state).await? {
            FirstFrame::Token(token) => Some(token),
            FirstFrame::Other => None,
            FirstFrame::Closed => {
                tracing::debug!(%conn_id, "closed before authenticating");
                return Ok(());
            }
        },
    };

    // --- Step 2: Accept or reject ---
    let (sender, outbound) = mpsc::unbounded_channel();
    let session = match state.gateway.begin(conn_id).accept(token.as_deref(), sender) {
        Ok(session) => session,
        Err(rejection) => {
            let reason = rejection.reason();
            outbox
                .send(&state.codec, ServerMessage::Rejected { reason })
                .await?;
            outbox.conn.close_with_reason(&reason.to_string()).await?;
            return Ok(());
        }
    };

    // From here on, an early return drops `session`, which deregisters.
    let identity = session.identity().clone();
    let profile = match state.directory.resolve_user(&identity).await {
        Ok(profile) => profile,
        Err(e) => {
            tracing::warn!(
                %conn_id,
                user_id = %identity.user_id,
                error = %e,
                "user lookup failed, using bare profile"
            );
            UserProfile::bare(identity.user_id.clone())
        }
    };
    outbox
        .send(
            &state.codec,
            ServerMessage::Authenticated {
                connection_id: conn_id.into_inner(),
                user_id: identity.user_id.clone(),
                audience: identity.audience,
                display_name: profile.display_name,
            },
        )
        .await?;

    // --- Step 3: Writer ---
    let writer = tokio::spawn(write_outbound(
        Arc::clone(&outbox),
        Arc::clone(&state),
        outbound,
    ));

    // --- Step 4: Message loop ---
    let reason = read_loop(&outbox, &state, &session).await;

    // --- Step 5: Close ---
    let closed = session.close(reason)?;
    writer.abort();
    let _ = outbox.conn.close().await;

    for &conversation_id in closed.conversations() {
        state.router.route(
            ChatEvent::UserLeft {
                conversation_id,
                user_id: identity.user_id.clone(),
            },
            &[Recipient::Conversation(conversation_id)],
        );
    }

    Ok(())
}

enum FirstFrame {
    Token(String),
    Other,
    Closed,
}

/// Waits for the client's `Authenticate` frame.
///
/// A timeout or any other frame counts as no token at all.
async fn await_token<H, D, C>(
    outbox: &Outbox,
    state: &ServerState<H, D, C>,
) -> Result<FirstFrame, GatewayError>
where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    let data = match tokio::time::timeout(
        state.config.handshake_timeout,
        outbox.conn.recv(),
    )
    .await
    {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => return Ok(FirstFrame::Closed),
        Ok(Err(e)) => return Err(GatewayError::Transport(e)),
        Err(_) => {
            tracing::debug!(conn_id = %outbox.conn.id(), "handshake timed out");
            return Ok(FirstFrame::Other);
        }
    };

    match state.codec.decode::<Envelope<ClientMessage>>(&data) {
        Ok(Envelope {
            payload: ClientMessage::Authenticate { token },
            ..
        }) => Ok(FirstFrame::Token(token)),
        _ => Ok(FirstFrame::Other),
    }
}

/// Drains the connection's outbound queue onto the socket.
///
/// Runs until the queue's senders are gone, a send fails, or the server
/// asks for the connection to be closed.
async fn write_outbound<H, D, C>(
    outbox: Arc<Outbox>,
    state: Arc<ServerState<H, D, C>>,
    mut outbound: OutboundReceiver,
) where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    let conn_id = outbox.conn.id();
    while let Some(msg) = outbound.recv().await {
        match msg {
            Outbound::Event(event) => {
                let sent = outbox
                    .send(&state.codec, ServerMessage::Event { event })
                    .await;
                if let Err(e) = sent {
                    tracing::debug!(%conn_id, error = %e, "event send failed");
                    break;
                }
            }
            Outbound::Close { reason } => {
                tracing::info!(%conn_id, %reason, "closing connection on server request");
                let _ = outbox
                    .send(
                        &state.codec,
                        ServerMessage::Disconnect {
                            reason: reason.clone(),
                        },
                    )
                    .await;
                let _ = outbox.conn.close_with_reason(&reason).await;
                outbox.closed_by_server.notify_one();
                break;
            }
        }
    }
}

/// Reads and dispatches client frames until the connection ends.
async fn read_loop<H, D, C>(
    outbox: &Outbox,
    state: &ServerState<H, D, C>,
    session: &AuthenticatedSession,
) -> CloseReason
where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    let conn_id = session.connection_id();

    loop {
        let received = tokio::select! {
            received = tokio::time::timeout(
                state.config.idle_timeout,
                outbox.conn.recv(),
            ) => received,
            // The close frame is out; don't wait on the client's reply.
            () = outbox.closed_by_server.notified() => {
                return CloseReason::Evicted;
            }
        };
        let data = match received {
            Ok(Ok(Some(data))) => data,
            // After an eviction the client's close reply lands here too.
            Ok(Ok(None)) if session.entry().is_none() => {
                return CloseReason::Evicted;
            }
            Ok(Ok(None)) => return CloseReason::ClientClosed,
            Ok(Err(e)) => return CloseReason::Transport(e.to_string()),
            Err(_) => return CloseReason::IdleTimeout,
        };

        // Evicted while we were waiting: the writer is already closing.
        let Some(entry) = session.entry() else {
            return CloseReason::Evicted;
        };

        let envelope: Envelope<ClientMessage> = match state.codec.decode(&data) {
            Ok(env) => env,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode envelope");
                let reply = ServerMessage::Error {
                    code: 400,
                    message: format!("invalid message: {e}"),
                };
                if let Err(e) = outbox.send(&state.codec, reply).await {
                    return CloseReason::Transport(e.to_string());
                }
                continue;
            }
        };

        match dispatch(outbox, state, &entry, envelope.payload).await {
            Ok(None) => {}
            Ok(Some(reason)) => return reason,
            Err(e) => return CloseReason::Transport(e.to_string()),
        }
    }
}

/// Handles one client message. Returns a close reason if the connection
/// should end.
async fn dispatch<H, D, C>(
    outbox: &Outbox,
    state: &ServerState<H, D, C>,
    entry: &RegisteredConnection,
    msg: ClientMessage,
) -> Result<Option<CloseReason>, GatewayError>
where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    let conn_id = entry.id();
    let user_id = entry.user_id();

    match msg {
        ClientMessage::Authenticate { .. } => {
            send_error(outbox, state, 400, "already authenticated").await?;
        }

        ClientMessage::Heartbeat { client_time } => {
            let ack = ServerMessage::HeartbeatAck {
                client_time,
                server_time: outbox.elapsed_ms(),
            };
            outbox.send(&state.codec, ack).await?;
        }

        ClientMessage::JoinConversation { conversation_id } => {
            if entry.join(conversation_id) {
                tracing::debug!(%conn_id, %user_id, %conversation_id, "joined conversation");
                state.router.route(
                    ChatEvent::UserJoined {
                        conversation_id,
                        user_id: user_id.clone(),
                    },
                    &[Recipient::Conversation(conversation_id)],
                );
            }
        }

        ClientMessage::LeaveConversation { conversation_id } => {
            if entry.leave(conversation_id) {
                tracing::debug!(%conn_id, %user_id, %conversation_id, "left conversation");
                state.router.route(
                    ChatEvent::UserLeft {
                        conversation_id,
                        user_id: user_id.clone(),
                    },
                    &[Recipient::Conversation(conversation_id)],
                );
            }
        }

        ClientMessage::SendMessage {
            conversation_id,
            body,
        } => {
            if !entry.is_member_of(conversation_id) {
                send_error(
                    outbox,
                    state,
                    403,
                    &format!("not a member of {conversation_id}"),
                )
                .await?;
                return Ok(None);
            }
            state.router.route(
                ChatEvent::MessageSent {
                    conversation_id,
                    from: user_id.clone(),
                    body,
                    sent_at: unix_millis(),
                },
                &[Recipient::Conversation(conversation_id)],
            );
        }

        ClientMessage::SendDirect { to, body } => {
            let event = ChatEvent::DirectMessage {
                from: user_id.clone(),
                to: to.clone(),
                body,
                sent_at: unix_millis(),
            };
            state.router.route(
                event,
                &[
                    Recipient::User(to),
                    Recipient::UserExcept(user_id.clone(), conn_id),
                ],
            );
        }

        ClientMessage::Disconnect { reason } => {
            tracing::info!(%conn_id, %user_id, %reason, "client disconnected");
            return Ok(Some(CloseReason::ClientDisconnect(reason)));
        }
    }

    Ok(None)
}

/// Sends a ServerMessage::Error envelope to the client.
async fn send_error<H, D, C>(
    outbox: &Outbox,
    state: &ServerState<H, D, C>,
    code: u16,
    message: &str,
) -> Result<(), GatewayError>
where
    H: HistorySink,
    D: UserDirectory,
    C: Codec,
{
    let reply = ServerMessage::Error {
        code,
        message: message.to_string(),
    };
    outbox.send(&state.codec, reply).await
}

/// Increments and returns the next sequence number.
fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
