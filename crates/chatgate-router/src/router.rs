use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chatgate_protocol::{ChatEvent, ConversationId, UserId};
use chatgate_session::{Outbound, RegisteredConnection, SessionRegistry};
use chatgate_transport::ConnectionId;
use tokio::sync::mpsc;

use crate::{HistoryRecord, HistorySink};

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every live connection of one user.
    User(UserId),

    /// Every live connection of one user except one. Used to echo a
    /// user's own actions to their other devices.
    UserExcept(UserId, ConnectionId),

    /// Every connection that joined the conversation.
    Conversation(ConversationId),

    /// Every live connection.
    Everyone,
}

/// Pushes events onto the outbound queues of live connections.
///
/// Each connection has exactly one FIFO queue and exactly one writer
/// draining it, so events routed to a connection arrive in the order they
/// were routed. Nothing is promised across connections.
///
/// History works the same way: one queue, one task appending to the sink,
/// so the sink sees records in routing order.
pub struct EventRouter<H: HistorySink> {
    registry: Arc<SessionRegistry>,
    history: Arc<H>,
    history_tx: Option<mpsc::UnboundedSender<HistoryRecord>>,
}

impl<H: HistorySink> EventRouter<H> {
    /// Creates a router and, when called inside a Tokio runtime, spawns the
    /// task that appends to `history`. Outside a runtime nothing is
    /// recorded.
    pub fn new(registry: Arc<SessionRegistry>, history: Arc<H>) -> Self {
        let history_tx = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(append_history(Arc::clone(&history), rx));
                Some(tx)
            }
            Err(_) => {
                tracing::debug!("no runtime, routed events won't be recorded");
                None
            }
        };
        Self {
            registry,
            history,
            history_tx,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &Arc<H> {
        &self.history
    }

    /// Delivers `event` to every live connection of `user_id`.
    ///
    /// Returns how many connections it was pushed to. A user with no live
    /// connection is not an error: the event is dropped and this returns 0.
    pub fn deliver(&self, event: ChatEvent, user_id: &UserId) -> usize {
        let targets = self.registry.connections_for(user_id);
        self.fan_out(event, targets)
    }

    /// Delivers `event` to every live connection matching `predicate`.
    pub fn broadcast<F>(&self, event: ChatEvent, predicate: F) -> usize
    where
        F: Fn(&RegisteredConnection) -> bool,
    {
        let targets: Vec<_> = self
            .registry
            .all_connections()
            .into_iter()
            .filter(|conn| predicate(conn))
            .collect();
        self.fan_out(event, targets)
    }

    /// Delivers `event` once to every connection addressed by any of
    /// `recipients`. A connection matched by several recipients still
    /// receives the event once.
    pub fn route(&self, event: ChatEvent, recipients: &[Recipient]) -> usize {
        let mut targets = BTreeMap::new();
        for recipient in recipients {
            let matched = match recipient {
                Recipient::User(user_id) => {
                    self.registry.connections_for(user_id)
                }
                Recipient::UserExcept(user_id, skip) => self
                    .registry
                    .connections_for(user_id)
                    .into_iter()
                    .filter(|conn| conn.id() != *skip)
                    .collect(),
                Recipient::Conversation(conversation_id) => self
                    .registry
                    .all_connections()
                    .into_iter()
                    .filter(|conn| conn.is_member_of(*conversation_id))
                    .collect(),
                Recipient::Everyone => self.registry.all_connections(),
            };
            for conn in matched {
                targets.entry(conn.id()).or_insert(conn);
            }
        }
        self.fan_out(event, targets.into_values())
    }

    fn fan_out<I>(&self, event: ChatEvent, targets: I) -> usize
    where
        I: IntoIterator<Item = Arc<RegisteredConnection>>,
    {
        let mut delivered = 0;
        for conn in targets {
            if conn.push(Outbound::Event(event.clone())) {
                delivered += 1;
            } else {
                // Closed between lookup and push; its deregistration is
                // already on the way.
                tracing::warn!(
                    connection_id = %conn.id(),
                    user_id = %conn.user_id(),
                    "dropped event for closed connection"
                );
            }
        }

        tracing::debug!(delivered, "event routed");
        self.record(event, delivered);
        delivered
    }

    /// Hands the event to the history sink without waiting for it.
    ///
    /// Events with no live recipient are recorded too: an offline user's
    /// messages still belong in the history.
    fn record(&self, event: ChatEvent, delivered_to: usize) {
        let record = HistoryRecord {
            event,
            delivered_to,
            routed_at: unix_millis(),
        };
        let Some(tx) = &self.history_tx else {
            return;
        };
        if tx.send(record).is_err() {
            tracing::warn!("history task gone, record dropped");
        }
    }
}

impl<H: HistorySink> Clone for EventRouter<H> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            history: Arc::clone(&self.history),
            history_tx: self.history_tx.clone(),
        }
    }
}

/// Appends records one at a time until every router clone is gone.
async fn append_history<H: HistorySink>(
    history: Arc<H>,
    mut records: mpsc::UnboundedReceiver<HistoryRecord>,
) {
    while let Some(record) = records.recv().await {
        history.append(record).await;
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{InMemoryHistory, NoopHistory};
    use chatgate_auth::Identity;
    use chatgate_protocol::Audience;
    use chatgate_session::{ConnectionHandle, OutboundReceiver};

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new())
    }

    fn router(registry: &Arc<SessionRegistry>) -> EventRouter<NoopHistory> {
        EventRouter::new(Arc::clone(registry), Arc::new(NoopHistory))
    }

    fn connect(
        registry: &SessionRegistry,
        id: u64,
        user: &str,
        audience: Audience,
    ) -> OutboundReceiver {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(id));
        registry
            .register(Identity::new(user, audience), handle)
            .unwrap();
        rx
    }

    fn message(body: &str) -> ChatEvent {
        ChatEvent::MessageSent {
            conversation_id: ConversationId(1),
            from: UserId::new("alice"),
            body: body.into(),
            sent_at: 0,
        }
    }

    fn next_event(rx: &mut OutboundReceiver) -> ChatEvent {
        match rx.try_recv().unwrap() {
            Outbound::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    // =====================================================================
    // deliver()
    // =====================================================================

    #[tokio::test]
    async fn test_deliver_to_offline_user_is_noop() {
        let registry = registry();
        let mut bob = connect(&registry, 1, "bob", Audience::Web);

        let delivered =
            router(&registry).deliver(message("hi"), &UserId::new("carol"));

        assert_eq!(delivered, 0);
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_reaches_web_and_mobile() {
        let registry = registry();
        let mut web = connect(&registry, 1, "alice", Audience::Web);
        let mut mobile = connect(&registry, 2, "alice", Audience::Mobile);
        let mut bob = connect(&registry, 3, "bob", Audience::Web);

        let delivered =
            router(&registry).deliver(message("hi"), &UserId::new("alice"));

        assert_eq!(delivered, 2);
        assert_eq!(next_event(&mut web), message("hi"));
        assert_eq!(next_event(&mut mobile), message("hi"));
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_skips_closed_connection() {
        let registry = registry();
        let closed = connect(&registry, 1, "alice", Audience::Web);
        let mut open = connect(&registry, 2, "alice", Audience::Mobile);
        drop(closed);

        let delivered =
            router(&registry).deliver(message("hi"), &UserId::new("alice"));

        assert_eq!(delivered, 1);
        assert_eq!(next_event(&mut open), message("hi"));
    }

    #[tokio::test]
    async fn test_deliver_preserves_order_per_connection() {
        let registry = registry();
        let mut rx = connect(&registry, 1, "alice", Audience::Web);
        let router = router(&registry);

        for i in 0..100 {
            router.deliver(message(&i.to_string()), &UserId::new("alice"));
        }

        for i in 0..100 {
            assert_eq!(next_event(&mut rx), message(&i.to_string()));
        }
    }

    // =====================================================================
    // broadcast() / route()
    // =====================================================================

    #[tokio::test]
    async fn test_broadcast_filters_by_predicate() {
        let registry = registry();
        let mut web = connect(&registry, 1, "alice", Audience::Web);
        let mut mobile = connect(&registry, 2, "bob", Audience::Mobile);

        let delivered = router(&registry)
            .broadcast(message("web only"), |c| c.audience() == Audience::Web);

        assert_eq!(delivered, 1);
        assert_eq!(next_event(&mut web), message("web only"));
        assert!(mobile.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_conversation_reaches_members_only() {
        let registry = registry();
        let mut alice = connect(&registry, 1, "alice", Audience::Web);
        let mut bob = connect(&registry, 2, "bob", Audience::Web);
        registry.get(ConnectionId::new(1)).unwrap().join(ConversationId(1));

        let delivered = router(&registry).route(
            message("members"),
            &[Recipient::Conversation(ConversationId(1))],
        );

        assert_eq!(delivered, 1);
        assert_eq!(next_event(&mut alice), message("members"));
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_overlapping_recipients_deliver_once() {
        let registry = registry();
        let mut alice_web = connect(&registry, 1, "alice", Audience::Web);
        let mut alice_mobile = connect(&registry, 2, "alice", Audience::Mobile);

        let delivered = router(&registry).route(
            message("once"),
            &[
                Recipient::User(UserId::new("alice")),
                Recipient::Everyone,
            ],
        );

        assert_eq!(delivered, 2);
        assert_eq!(next_event(&mut alice_web), message("once"));
        assert!(alice_web.try_recv().is_err());
        assert_eq!(next_event(&mut alice_mobile), message("once"));
        assert!(alice_mobile.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_route_user_except_skips_origin() {
        let registry = registry();
        let mut origin = connect(&registry, 1, "alice", Audience::Web);
        let mut other = connect(&registry, 2, "alice", Audience::Mobile);

        let delivered = router(&registry).route(
            message("echo"),
            &[Recipient::UserExcept(
                UserId::new("alice"),
                ConnectionId::new(1),
            )],
        );

        assert_eq!(delivered, 1);
        assert!(origin.try_recv().is_err());
        assert_eq!(next_event(&mut other), message("echo"));
    }

    // =====================================================================
    // history
    // =====================================================================

    #[tokio::test]
    async fn test_routed_events_reach_history() {
        let registry = registry();
        let _rx = connect(&registry, 1, "alice", Audience::Web);
        let history = Arc::new(InMemoryHistory::new());
        let router = EventRouter::new(Arc::clone(&registry), Arc::clone(&history));

        router.deliver(message("kept"), &UserId::new("alice"));
        router.deliver(message("offline"), &UserId::new("bob"));

        tokio::time::timeout(Duration::from_secs(1), async {
            while history.len().await < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("history appends should land");

        let delivered: Vec<_> = history
            .records()
            .await
            .into_iter()
            .map(|r| (r.event, r.delivered_to))
            .collect();
        assert_eq!(
            delivered,
            vec![(message("kept"), 1), (message("offline"), 0)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_history_keeps_routing_order() {
        const EVENTS: u64 = 2000;
        let registry = registry();
        let _rx = connect(&registry, 1, "alice", Audience::Web);
        let history = Arc::new(InMemoryHistory::new());
        let router = EventRouter::new(Arc::clone(&registry), Arc::clone(&history));

        for i in 0..EVENTS {
            let event = ChatEvent::MessageSent {
                conversation_id: ConversationId(1),
                from: UserId::new("alice"),
                body: String::new(),
                sent_at: i,
            };
            router.deliver(event, &UserId::new("alice"));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while (history.len().await as u64) < EVENTS {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("history appends should land");

        let order: Vec<u64> = history
            .records()
            .await
            .into_iter()
            .map(|r| match r.event {
                ChatEvent::MessageSent { sent_at, .. } => sent_at,
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(order, (0..EVENTS).collect::<Vec<_>>());
    }

    #[test]
    fn test_router_outside_runtime_records_nothing() {
        let registry = registry();
        let history = Arc::new(InMemoryHistory::new());
        let router = EventRouter::new(Arc::clone(&registry), Arc::clone(&history));

        router.deliver(message("lost"), &UserId::new("alice"));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert_eq!(rt.block_on(history.len()), 0);
    }

    #[test]
    fn test_deliver_outside_runtime_still_delivers() {
        let registry = registry();
        let mut rx = connect(&registry, 1, "alice", Audience::Web);

        let delivered =
            router(&registry).deliver(message("sync"), &UserId::new("alice"));

        assert_eq!(delivered, 1);
        assert_eq!(next_event(&mut rx), message("sync"));
    }
}
