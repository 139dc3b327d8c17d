//! wsrelay Core - Shared types for the queue-to-WebSocket relay
//!
//! This crate provides the types shared between the relay daemon library
//! (`wsrelayd`) and the `relayd` binary: subscriber identity, the payload
//! type, the structured logging vocabulary and the configuration model.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod event;
pub mod subscriber;

// Re-exports for convenience
pub use config::{BrokerConfig, LogConfig, LogRotation, RelayConfig, ServerConfig};
pub use error::{ConfigError, ConfigResult};
pub use event::{EventKind, EventStatus};
pub use subscriber::{Payload, SubscriberId};
