//! # spore-sync — Replica reconciliation over the network
//!
//! Peers exchange vector clocks and send each other the ops they are
//! missing, then keep forwarding new local commits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (duplex)    │   JSON SYNC/DIFF    │ (hub)       │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Replica     │                     │ Replica     │
//! └─────────────┘                     └─────────────┘
//!
//!   Replica ◄──► <ns>/states, <ns>/ops ◄──► Replica        (pub/sub)
//!                     TopicBus
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope
//! - [`session`] — per-peer SYNC/DIFF state machine
//! - [`duplex`] — drives a session over one WebSocket
//! - [`client`] / [`server`] — the two ends of the duplex transport
//! - [`broadcast`] — in-process topic bus
//! - [`pubsub`] — reconciliation over shared topics

pub mod broadcast;
pub mod client;
pub mod duplex;
pub mod protocol;
pub mod pubsub;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::{Topic, TopicBus, TopicMessage, TopicStats};
pub use client::{connect, SyncClient};
pub use protocol::{MessageKind, ProtocolError, WireMessage, PROTOCOL_VERSION};
pub use pubsub::{join, PubSubConfig, PubSubHandle};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Outbound, SessionState, SyncSession};
