//! Registry entries and the per-connection outbound queue.

use std::time::Instant;

use chatgate_auth::Identity;
use chatgate_protocol::{Audience, ChatEvent, ConversationId, UserId};
use chatgate_transport::ConnectionId;
use dashmap::DashSet;
use tokio::sync::mpsc;

/// Something queued for delivery to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A routed chat event.
    Event(ChatEvent),
    /// The server wants this connection gone (eviction, shutdown).
    Close { reason: String },
}

/// Receiving half of a connection's outbound queue, drained by that
/// connection's writer task.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// What the gateway hands the registry for a freshly accepted connection:
/// its transport id and the sending half of its outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub sender: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Creates a handle together with the receiver its writer will drain.
    pub fn channel(id: ConnectionId) -> (Self, OutboundReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { id, sender }, receiver)
    }
}

/// A live connection as recorded in the registry.
///
/// Shared as `Arc<RegisteredConnection>`: the router holds clones only for
/// the duration of a fan-out, never across an await.
#[derive(Debug)]
pub struct RegisteredConnection {
    id: ConnectionId,
    identity: Identity,
    created_at: Instant,
    sender: mpsc::UnboundedSender<Outbound>,
    conversations: DashSet<ConversationId>,
}

impl RegisteredConnection {
    pub(crate) fn new(identity: Identity, handle: ConnectionHandle) -> Self {
        Self {
            id: handle.id,
            identity,
            created_at: Instant::now(),
            sender: handle.sender,
            conversations: DashSet::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn audience(&self) -> Audience {
        self.identity.audience
    }

    /// When the connection was registered.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Queues `msg` for this connection.
    ///
    /// Returns `false` if the connection's writer is already gone; the
    /// message is dropped in that case.
    pub fn push(&self, msg: Outbound) -> bool {
        self.sender.send(msg).is_ok()
    }

    /// Whether the writer side has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Marks this connection as listening to `conversation`. Returns
    /// `false` if it already was.
    pub fn join(&self, conversation: ConversationId) -> bool {
        self.conversations.insert(conversation)
    }

    /// Stops listening to `conversation`. Returns `false` if it wasn't.
    pub fn leave(&self, conversation: ConversationId) -> bool {
        self.conversations.remove(&conversation).is_some()
    }

    pub fn is_member_of(&self, conversation: ConversationId) -> bool {
        self.conversations.contains(&conversation)
    }

    /// Conversations this connection listens to, sorted.
    pub fn conversations(&self) -> Vec<ConversationId> {
        let mut out: Vec<_> =
            self.conversations.iter().map(|c| *c).collect();
        out.sort();
        out
    }
}
