//! Materialized store: folds the flat fact log into queryable entities.
//!
//! ```text
//!  Store::add(entity) ──► Replica::commit_facts(changeset)   (one batch)
//!          │
//!          └──► optimistic insert into Index
//!
//!  Update / Apply event ──► Index::fold(full snapshot) ──► Change event
//! ```
//!
//! The index is always rebuilt from the whole snapshot, never patched.
//! `add` holds the index lock across its commit, so a re-derivation that
//! races it lands after the optimistic insert.

pub mod entity;
pub mod index;
pub mod property;
pub mod query;

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::event::LogEvent;
use crate::replica::Replica;

pub use entity::{materialize, Entity};
pub use index::Index;
pub use property::{flatten, Property};
pub use query::QuerySet;

/// Queryable view over a replica. Clones share the same index.
#[derive(Debug, Clone)]
pub struct Store {
    replica: Replica,
    index: Arc<RwLock<Index>>,
}

impl Store {
    /// Build the index from the replica's current snapshot.
    ///
    /// Inside a tokio runtime this also starts the watcher (see [`Store::watch`]);
    /// it stops on the first event after every clone of the store is dropped.
    pub fn new(replica: Replica) -> Self {
        let store = Self::detached(replica);
        if let Ok(handle) = Handle::try_current() {
            let _ = store.watch_on(&handle);
        }
        store
    }

    /// Build the index without watching the replica. Call
    /// [`Store::refresh`] or [`Store::watch`] to follow remote merges.
    pub fn detached(replica: Replica) -> Self {
        let index = Index::fold(replica.snapshot());
        Self {
            replica,
            index: Arc::new(RwLock::new(index)),
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit the entity's changeset as one batch and insert it locally
    /// before the log's own notification comes back.
    pub fn add(&self, entity: &Entity) -> Entity {
        let facts = entity
            .changeset()
            .iter()
            .map(|p| p.fact.clone())
            .collect();
        let mut index = self.write();
        self.replica.commit_facts(facts);

        let committed = entity.committed();
        index.insert(committed.clone());
        committed
    }

    /// Replace the index with a fold of the full snapshot.
    pub fn refresh(&self) {
        refresh_index(&self.replica, &self.index);
    }

    /// Spawn the task that re-derives the index on every `Update`/`Apply`
    /// and publishes one `Change` per re-derivation.
    ///
    /// [`Store::new`] already does this inside a runtime; use it after
    /// [`Store::detached`]. Must be called from within a tokio runtime.
    /// Abort the handle to stop.
    pub fn watch(&self) -> JoinHandle<()> {
        self.watch_on(&Handle::current())
    }

    fn watch_on(&self, handle: &Handle) -> JoinHandle<()> {
        let replica = self.replica.clone();
        let index = Arc::downgrade(&self.index);
        let rx = self.replica.subscribe();
        handle.spawn(follow(replica, index, rx))
    }

    /// Stream of `Change` notifications.
    pub fn subscribe(&self) -> Changes {
        Changes {
            rx: self.replica.subscribe(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Point-in-time copy of the index.
    pub fn index(&self) -> Index {
        self.read().clone()
    }

    /// All entities, ordered by id.
    pub fn entities(&self) -> QuerySet<Entity> {
        QuerySet::new(self.read().sorted())
    }

    pub fn map<U>(&self, f: impl FnMut(&Entity) -> U) -> QuerySet<U> {
        self.entities().map(f)
    }

    pub fn filter(&self, predicate: impl FnMut(&Entity) -> bool) -> QuerySet<Entity> {
        self.entities().filter(predicate)
    }

    pub fn find(&self, predicate: impl FnMut(&Entity) -> bool) -> Option<Entity> {
        self.entities().find(predicate).cloned()
    }

    pub fn reduce<A>(&self, init: A, f: impl FnMut(A, &Entity) -> A) -> A {
        self.entities().reduce(init, f)
    }
}

fn refresh_index(replica: &Replica, index: &RwLock<Index>) {
    let mut index = index.write().unwrap_or_else(PoisonError::into_inner);
    *index = Index::fold(replica.snapshot());
    log::trace!("Re-derived index with {} entities", index.len());
}

async fn follow(replica: Replica, index: Weak<RwLock<Index>>, mut rx: broadcast::Receiver<LogEvent>) {
    loop {
        match rx.recv().await {
            Ok(LogEvent::Update(_)) | Ok(LogEvent::Apply) => {}
            Ok(LogEvent::Change) => continue,
            Err(RecvError::Lagged(n)) => {
                log::warn!("Store watcher lagged by {n} events, re-deriving");
            }
            Err(RecvError::Closed) => break,
        }
        let Some(index) = index.upgrade() else {
            log::debug!("Store dropped, watcher for {} stopping", replica.namespace());
            break;
        };
        refresh_index(&replica, &index);
        replica.events().publish(LogEvent::Change);
    }
}

/// Receiver filtered down to `Change` events.
pub struct Changes {
    rx: broadcast::Receiver<LogEvent>,
}

impl Changes {
    /// Wait for the next change. `false` once the replica is gone.
    pub async fn changed(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(LogEvent::Change) | Err(RecvError::Lagged(_)) => return true,
                Ok(_) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
    }
}
