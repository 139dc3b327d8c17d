//! wsrelay Daemon - Subscriber registry and broadcast server
//!
//! This crate provides the core infrastructure of the relay:
//! - `registry` - Thread-safe set of active subscribers
//! - `broadcast` - Fan-out of one payload to every subscriber, with eviction
//! - `ingest` - Sequential loop from a message source into the broadcaster
//! - `server` - WebSocket acceptor that registers and deregisters subscribers
//! - `source` - Message sources (AMQP queue, in-process channel)
//! - `logging` - Tracing subscriber setup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        relayd                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  MessageSource  │────▶│        IngestLoop           │    │
//! │  │  (AMQP queue)   │     │  (one payload at a time)    │    │
//! │  └─────────────────┘     └──────────────┬──────────────┘    │
//! │                                         │ broadcast()       │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   RelayServer   │────▶│     SubscriberRegistry      │    │
//! │  │  (WebSocket)    │     │  (snapshot, then write)     │    │
//! │  └────────┬────────┘     └─────────────────────────────┘    │
//! │           │ one task per connection                         │
//! │           ▼                                                 │
//! │  ┌─────────────────┐                                        │
//! │  │ConnectionHandler│                                        │
//! │  └─────────────────┘                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Per-subscriber failures never propagate beyond that subscriber

pub mod broadcast;
pub mod ingest;
pub mod logging;
pub mod registry;
pub mod server;
pub mod source;
pub mod subscriber;

pub use broadcast::{BroadcastReport, Broadcaster, DeliveryError};
pub use ingest::{IngestError, IngestLoop};
pub use registry::SubscriberRegistry;
pub use server::{RelayServer, ServerError, ServerSettings};
pub use source::{AmqpSource, MessageSource, SourceError};
pub use subscriber::{FrameSink, SinkError, Subscriber};
