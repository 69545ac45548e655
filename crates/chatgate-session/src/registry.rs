//! The session registry: which identities hold which live connections.
//!
//! # Concurrency
//!
//! Two sharded maps, no global lock:
//!
//! - `connections`: `ConnectionId → Arc<RegisteredConnection>` (primary)
//! - `by_user`: `UserId → {ConnectionId}` (index for `connections_for`)
//!
//! Operations on distinct connections or users only contend when they hash
//! to the same shard. Lock discipline:
//!
//! - `register` is the only path that holds two guards at once, always in
//!   the order `connections` shard → `by_user` shard. It writes the index
//!   while holding the still-vacant primary slot, so a reader that finds
//!   the id in the index waits on that slot until the entry is complete.
//! - every other method holds at most one guard at a time.
//!
//! All methods are synchronous. Nothing here may be held across `.await`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chatgate_auth::Identity;
use chatgate_protocol::UserId;
use chatgate_transport::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{ConnectionHandle, RegisteredConnection, RegistryError};

/// Tracks every live, authenticated connection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: DashMap<ConnectionId, Arc<RegisteredConnection>>,
    by_user: DashMap<UserId, BTreeSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new connection owned by `identity`.
    ///
    /// # Errors
    /// [`RegistryError::DuplicateConnection`] if `handle.id` is already
    /// registered; the existing entry is kept as is.
    pub fn register(
        &self,
        identity: Identity,
        handle: ConnectionHandle,
    ) -> Result<ConnectionId, RegistryError> {
        let id = handle.id;
        match self.connections.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateConnection(id)),
            Entry::Vacant(slot) => {
                let user_id = identity.user_id.clone();
                let audience = identity.audience;
                let entry = Arc::new(RegisteredConnection::new(identity, handle));

                self.by_user.entry(user_id.clone()).or_default().insert(id);
                slot.insert(entry);

                tracing::info!(
                    connection_id = %id,
                    %user_id,
                    %audience,
                    "connection registered"
                );
                Ok(id)
            }
        }
    }

    /// Removes a connection. Idempotent: an unknown id yields `Ok(None)`.
    ///
    /// Disconnects race with forced evictions, so both sides may try to
    /// remove the same connection; only the first gets the entry back.
    ///
    /// # Errors
    /// [`RegistryError::Corruption`] if the connection was present but not
    /// indexed under its owner.
    pub fn deregister(
        &self,
        id: ConnectionId,
    ) -> Result<Option<Arc<RegisteredConnection>>, RegistryError> {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return Ok(None);
        };

        let user_id = entry.user_id();
        let indexed = match self.by_user.get_mut(user_id) {
            Some(mut ids) => ids.remove(&id),
            None => false,
        };
        self.by_user.remove_if(user_id, |_, ids| ids.is_empty());

        if !indexed {
            tracing::error!(
                connection_id = %id,
                %user_id,
                "registered connection missing from user index"
            );
            return Err(RegistryError::Corruption {
                connection_id: id,
                user_id: user_id.clone(),
            });
        }

        tracing::info!(
            connection_id = %id,
            %user_id,
            lifetime_ms = entry.created_at().elapsed().as_millis() as u64,
            "connection deregistered"
        );
        Ok(Some(entry))
    }

    /// Live connections of `user_id`, ordered by connection id. Empty if
    /// the user has none.
    pub fn connections_for(
        &self,
        user_id: &UserId,
    ) -> Vec<Arc<RegisteredConnection>> {
        // Copy the ids out so the index guard is released before the
        // primary map is touched.
        let ids: Vec<ConnectionId> = match self.by_user.get(user_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };

        ids.into_iter()
            .filter_map(|id| {
                self.connections.get(&id).map(|e| Arc::clone(e.value()))
            })
            .collect()
    }

    /// Every live connection, ordered by connection id.
    pub fn all_connections(&self) -> Vec<Arc<RegisteredConnection>> {
        let mut all: Vec<_> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Looks up one connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<RegisteredConnection>> {
        self.connections.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Whether `user_id` has at least one live connection.
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.by_user.contains_key(user_id)
    }

    /// Removes and returns every connection (gateway shutdown).
    ///
    /// # Errors
    /// Stops at the first [`RegistryError::Corruption`].
    pub fn drain(&self) -> Result<Vec<Arc<RegisteredConnection>>, RegistryError> {
        let ids: Vec<ConnectionId> =
            self.connections.iter().map(|e| *e.key()).collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.deregister(id)? {
                drained.push(entry);
            }
        }
        Ok(drained)
    }

    /// Point-in-time view of `connection id → identity`.
    pub fn snapshot(&self) -> BTreeMap<ConnectionId, Identity> {
        self.connections
            .iter()
            .map(|e| (*e.key(), e.value().identity().clone()))
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of distinct users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Drops `id` from its owner's index but keeps the connection, the
    /// state `deregister` reports as [`RegistryError::Corruption`].
    #[cfg(any(test, feature = "test-util"))]
    #[doc(hidden)]
    pub fn unindex(&self, id: ConnectionId) -> bool {
        let Some(user_id) = self.get(id).map(|e| e.user_id().clone()) else {
            return false;
        };
        match self.by_user.get_mut(&user_id) {
            Some(mut ids) => ids.remove(&id),
            None => false,
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
