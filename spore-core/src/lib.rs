//! # spore-core — Replicated triple log and its materialized store
//!
//! ## Architecture
//!
//! ```text
//!  application
//!      │ commit(records)              Store::add(entity)
//!      ▼                                     │
//! ┌─────────────┐  Update / Apply   ┌────────▼────────┐
//! │  Replica    │ ────────────────► │  Store          │
//! │ (facade)    │    EventBus       │  Index::fold    │
//! └──────┬──────┘                   └─────────────────┘
//!        │
//!        ▼
//! ┌─────────────┐
//! │ MemoryLog   │  append / apply / diff / vclock / snapshot
//! └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`fact`] — triples, attribute paths, replica ids
//! - [`vclock`] — vector clocks
//! - [`oplog`] — the replicated log primitive
//! - [`event`] — typed, deferred event bus
//! - [`replica`] — log facade: batching commits, merging remote ops
//! - [`store`] — entities, index, queries

pub mod event;
pub mod fact;
pub mod oplog;
pub mod replica;
pub mod store;
pub mod vclock;

// Re-exports for convenience
pub use event::{EventBus, LogEvent};
pub use fact::{AttributePath, Fact, ReplicaId};
pub use oplog::{LogError, MemoryLog, Op, ReplicatedLog};
pub use replica::{Record, Replica, ReplicaConfig};
pub use store::{Changes, Entity, Index, Property, QuerySet, Store};
pub use vclock::VClock;
