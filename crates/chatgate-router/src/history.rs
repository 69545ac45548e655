//! The persistence hook for routed events.
//!
//! chatgate doesn't store chat history itself. Whatever owns the message
//! tables (a database writer, a queue producer) implements
//! [`HistorySink`], and the router hands it every event it routes.

use chatgate_protocol::ChatEvent;
use tokio::sync::Mutex;

/// One routed event, as handed to the [`HistorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub event: ChatEvent,
    /// Number of live connections the event was pushed to.
    pub delivered_to: usize,
    /// Unix milliseconds at routing time.
    pub routed_at: u64,
}

/// Receives every event the router delivers.
///
/// Appends run on their own spawned task. The router never awaits them,
/// so a slow sink delays nothing but itself, and a failing sink must deal
/// with its own errors (log them, retry, drop).
///
/// # Example
///
/// ```rust
/// use chatgate_router::{HistoryRecord, HistorySink};
///
/// struct LogHistory;
///
/// impl HistorySink for LogHistory {
///     async fn append(&self, record: HistoryRecord) {
///         println!("{:?} -> {} connections", record.event, record.delivered_to);
///     }
/// }
/// ```
pub trait HistorySink: Send + Sync + 'static {
    /// Persists one record.
    fn append(
        &self,
        record: HistoryRecord,
    ) -> impl std::future::Future<Output = ()> + Send;
}

impl<T: HistorySink> HistorySink for std::sync::Arc<T> {
    fn append(
        &self,
        record: HistoryRecord,
    ) -> impl std::future::Future<Output = ()> + Send {
        (**self).append(record)
    }
}

/// Discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHistory;

impl HistorySink for NoopHistory {
    async fn append(&self, _record: HistoryRecord) {}
}

/// Keeps records in memory, in append order. For tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything appended so far.
    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

impl HistorySink for InMemoryHistory {
    async fn append(&self, record: HistoryRecord) {
        self.records.lock().await.push(record);
    }
}
