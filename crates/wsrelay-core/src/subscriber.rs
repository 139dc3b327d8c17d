//! Subscriber identity and payload types.

use std::fmt;

/// Opaque message payload relayed from the queue to subscribers.
///
/// Cloning is a reference-count bump, so one payload can be handed to
/// every subscriber of a broadcast pass without copying the bytes.
pub type Payload = bytes::Bytes;

/// Identity of one live downstream connection.
///
/// Allocated monotonically by the connection acceptor. A reconnecting
/// peer always receives a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Creates a SubscriberId from a raw number.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric id.
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl From<u64> for SubscriberId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}
