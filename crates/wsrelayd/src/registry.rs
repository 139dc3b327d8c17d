//! Subscriber registry.
//!
//! The registry is the only shared mutable state in the relay: a map from
//! [`SubscriberId`] to [`Subscriber`] behind a single lock. It is owned
//! explicitly and handed to the server and the broadcaster at construction
//! time, so both can be exercised without a network stack or broker.
//!
//! # Locking
//!
//! - One `parking_lot::RwLock`; mutations take the write half, snapshots the
//!   read half.
//! - The lock is never held across an `.await`. Broadcasts iterate an owned
//!   snapshot, so slow subscriber writes never block registration.
//! - Operations are synchronous, which lets the connection drop guard
//!   deregister from `Drop`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use wsrelay_core::SubscriberId;

use crate::subscriber::Subscriber;

/// Thread-safe set of active subscribers.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    members: Arc<RwLock<HashMap<SubscriberId, Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber. A duplicate id replaces the previous entry.
    pub fn register(&self, subscriber: Subscriber) {
        let id = subscriber.id();
        let replaced = self.members.write().insert(id, subscriber);
        if replaced.is_some() {
            debug!(subscriber_id = %id, "Replaced existing registry entry");
        }
    }

    /// Removes a subscriber if present.
    ///
    /// Absent ids are not an error: the read path and the write path may
    /// both try to remove the same subscriber. Returns true if an entry was
    /// removed by this call.
    pub fn deregister(&self, id: SubscriberId) -> bool {
        self.members.write().remove(&id).is_some()
    }

    /// Returns the current members for one broadcast pass.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.members.read().values().cloned().collect()
    }

    /// Removes and returns every member (used at shutdown).
    pub fn drain(&self) -> Vec<Subscriber> {
        self.members.write().drain().map(|(_, sub)| sub).collect()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }
}
