//! Log facade: one replica of one namespace.
//!
//! ```text
//!  commit(records) ──► flatten ──► [aggregation bracket] ──► ReplicatedLog
//!                                                             │ on_update
//!  apply(ops) ──────────────────────────────────────────────► │ on_apply
//!                                                             ▼
//!                                                   EventBus (deferred)
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::{sink, Sink};
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::event::{EventBus, LogEvent};
use crate::fact::{Fact, ReplicaId};
use crate::oplog::{LogError, MemoryLog, Op, ReplicatedLog};
use crate::store::property::flatten;
use crate::vclock::VClock;

/// Fields accepted as the identity of an object record.
const IDENTITY_FIELDS: [&str; 2] = ["id", "$id"];

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub namespace: String,
    /// Writer identity; a random one is drawn when `None`
    pub replica_id: Option<ReplicaId>,
    /// Events buffered per subscriber before it lags
    pub event_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            replica_id: None,
            event_capacity: 256,
        }
    }
}

impl ReplicaConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_replica_id(mut self, id: impl Into<ReplicaId>) -> Self {
        self.replica_id = Some(id.into());
        self
    }
}

/// One commit input: a raw fact, or an object flattened per attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Fact(Fact),
    Object {
        id: String,
        attributes: Map<String, Value>,
    },
}

impl Record {
    /// Resolve untyped input. Objects without an identity field and
    /// anything else unrecognised resolve to `None`.
    pub fn from_json(value: Value) -> Option<Record> {
        match value {
            Value::Array(items) if items.len() == 3 => match serde_json::from_value(Value::Array(items)) {
                Ok(fact) => Some(Record::Fact(fact)),
                Err(e) => {
                    log::debug!("Skipping malformed fact: {e}");
                    None
                }
            },
            Value::Object(mut attributes) => {
                let id = IDENTITY_FIELDS
                    .iter()
                    .find_map(|field| attributes.get(*field).and_then(identity_of))?;
                for field in IDENTITY_FIELDS {
                    attributes.remove(field);
                }
                Some(Record::Object { id, attributes })
            }
            other => {
                log::debug!("Skipping unrecognised record: {other}");
                None
            }
        }
    }

    pub fn into_facts(self) -> Vec<Fact> {
        match self {
            Record::Fact(fact) => vec![fact],
            Record::Object { id, attributes } => flatten(&id, &Value::Object(attributes))
                .into_iter()
                .map(|p| p.fact)
                .collect(),
        }
    }
}

fn identity_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl From<Fact> for Record {
    fn from(fact: Fact) -> Self {
        Record::Fact(fact)
    }
}

struct ReplicaInner {
    namespace: String,
    replica_id: ReplicaId,
    log: Mutex<Box<dyn ReplicatedLog>>,
    events: EventBus,
}

/// Handle to a replica. Clones share the same log and event bus.
#[derive(Clone)]
pub struct Replica {
    inner: Arc<ReplicaInner>,
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("namespace", &self.inner.namespace)
            .field("replica_id", &self.inner.replica_id)
            .finish()
    }
}

impl Replica {
    /// Replica of `namespace` with a random identity.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self::create(ReplicaConfig::new(namespace))
    }

    pub fn create(config: ReplicaConfig) -> Self {
        let replica_id = config.replica_id.unwrap_or_else(ReplicaId::random);
        Self::with_log(config, Box::new(MemoryLog::new(replica_id)))
    }

    /// Wrap an existing log. The log's own replica id wins over the config's.
    pub fn with_log(config: ReplicaConfig, mut oplog: Box<dyn ReplicatedLog>) -> Self {
        let events = EventBus::new(config.event_capacity);

        let bus = events.clone();
        oplog.set_on_update(Box::new(move |ops| {
            bus.publish(LogEvent::Update(Arc::new(ops.to_vec())));
        }));
        let bus = events.clone();
        oplog.set_on_apply(Box::new(move || {
            bus.publish(LogEvent::Apply);
        }));

        let replica_id = oplog.replica();
        log::debug!("Created replica {replica_id} for namespace {}", config.namespace);

        Self {
            inner: Arc::new(ReplicaInner {
                namespace: config.namespace,
                replica_id,
                log: Mutex::new(oplog),
                events,
            }),
        }
    }

    fn log(&self) -> MutexGuard<'_, Box<dyn ReplicatedLog>> {
        self.inner.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.inner.replica_id
    }

    /// Commit records as one batch: exactly one `Update` event for the whole call.
    pub fn commit<R: Into<Record>>(&self, records: impl IntoIterator<Item = R>) -> Vec<Op> {
        let facts: Vec<Fact> = records
            .into_iter()
            .flat_map(|r| r.into().into_facts())
            .collect();
        self.commit_facts(facts)
    }

    /// Commit untyped input: one record or an array of records.
    pub fn commit_json(&self, input: Value) -> Vec<Op> {
        let records: Vec<Record> = match input {
            Value::Array(items) if !is_raw_fact(&items) => {
                items.into_iter().filter_map(Record::from_json).collect()
            }
            single => Record::from_json(single).into_iter().collect(),
        };
        self.commit(records)
    }

    /// Append facts inside one aggregation bracket.
    pub fn commit_facts(&self, facts: Vec<Fact>) -> Vec<Op> {
        if facts.is_empty() {
            return Vec::new();
        }

        let mut oplog = self.log();
        oplog.set_aggregation(true);
        let ops: Vec<Op> = facts.into_iter().map(|fact| oplog.append(fact)).collect();
        oplog.set_aggregation(false);
        drop(oplog);

        log::debug!("Replica {} committed {} facts", self.inner.replica_id, ops.len());
        ops
    }

    /// Merge remote ops. `LogError::OutOfOrder` leaves the log unchanged.
    pub fn apply(&self, ops: &[Op]) -> Result<usize, LogError> {
        let merged = self.log().apply(ops)?;
        if merged > 0 {
            log::debug!("Replica {} merged {merged} remote ops", self.inner.replica_id);
        }
        Ok(merged)
    }

    /// Merge a JSON-encoded op list.
    pub fn apply_json(&self, json: &str) -> Result<usize, LogError> {
        let ops: Vec<Op> =
            serde_json::from_str(json).map_err(|e| LogError::Encoding(e.to_string()))?;
        self.apply(&ops)
    }

    pub fn vclock(&self) -> VClock {
        self.log().vclock()
    }

    /// Ops not reflected by `clock`.
    pub fn diff(&self, clock: &VClock) -> Vec<Op> {
        self.log().diff(clock)
    }

    /// Every fact in log order.
    pub fn snapshot(&self) -> Vec<Fact> {
        self.log().snapshot()
    }

    /// Full history as a JSON op list.
    pub fn dump(&self) -> Result<String, LogError> {
        let ops = self.diff(&VClock::new());
        serde_json::to_string(&ops).map_err(|e| LogError::Encoding(e.to_string()))
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.events.subscribe()
    }

    /// Stream of the op batches produced by local commits, one item per commit.
    ///
    /// Starts at the next commit and ends once every handle to the replica is
    /// gone. Batches missed by a lagging reader are skipped; recover them
    /// with [`Replica::diff`].
    pub fn reader(&self) -> BoxStream<'static, Arc<Vec<Op>>> {
        let replica_id = self.inner.replica_id;
        stream::unfold(self.subscribe(), move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(LogEvent::Update(ops)) => return Some((ops, rx)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Reader of replica {replica_id} skipped {n} events");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Sink merging each op batch written to it, as [`Replica::apply`] does.
    pub fn writer(&self) -> impl Sink<Vec<Op>, Error = LogError> + Send + 'static {
        sink::unfold(self.clone(), |replica, ops: Vec<Op>| async move {
            replica.apply(&ops)?;
            Ok::<_, LogError>(replica)
        })
    }
}

/// `["id", "attr", value]` rather than a list of records.
fn is_raw_fact(items: &[Value]) -> bool {
    items.len() == 3 && items[0].is_string() && !items[1].is_object()
}
