//! Event delivery for chatgate.
//!
//! The [`EventRouter`] turns "send this event to alice" or "send this to
//! everyone in conversation 7" into pushes onto the outbound queues of the
//! matching live connections, as found in the
//! [`SessionRegistry`](chatgate_session::SessionRegistry).
//!
//! ```text
//! handler ──route()──▶ EventRouter ──lookup──▶ SessionRegistry
//!                           │
//!                           ├──push──▶ connection queue ──▶ writer task
//!                           └──spawn─▶ HistorySink::append
//! ```
//!
//! Delivery never blocks and never fails: a connection that closed a
//! moment ago simply doesn't get the event.

mod history;
mod router;

pub use history::{HistoryRecord, HistorySink, InMemoryHistory, NoopHistory};
pub use router::{EventRouter, Recipient};
