//! Pub/sub transport: replicas reconcile over two shared topics.
//!
//! ```text
//!  <namespace>/states   SYNC payloads: raw vector clock JSON
//!  <namespace>/ops      DIFF payloads: raw op list JSON
//!
//!  join ── subscribe both ── settle delay ── publish own clock
//!                                              │
//!      every message from peer P ──► SyncSession[P] ──► publish replies
//!      local Update ──► publish once on <namespace>/ops
//! ```
//!
//! There is no connection per peer: a session is created the first time a
//! peer is heard from, and everything published reaches every member.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use spore_core::{LogEvent, Op, Replica, ReplicaId, VClock};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::broadcast::{Topic, TopicBus, TopicMessage};
use crate::session::{Outbound, SessionState, SyncSession};

/// Pub/sub configuration.
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Wait between subscribing and the first announcement, so the
    /// subscription is live before peers answer
    pub settle_delay: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
        }
    }
}

pub fn states_topic(namespace: &str) -> String {
    format!("{namespace}/states")
}

pub fn ops_topic(namespace: &str) -> String {
    format!("{namespace}/ops")
}

/// Membership in a namespace's topics. Dropping it also leaves.
pub struct PubSubHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    peers: Arc<RwLock<HashMap<ReplicaId, SessionState>>>,
    bus: TopicBus,
    namespace: String,
}

impl PubSubHandle {
    /// Unsubscribe and stop forwarding. Topics left without subscribers are
    /// removed from the bus.
    pub async fn leave(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        for topic in [states_topic(&self.namespace), ops_topic(&self.namespace)] {
            if self.bus.remove_if_unused(&topic).await {
                debug!("Removed idle topic {topic}");
            }
        }
    }

    /// Peers heard from so far and the session state with each.
    pub async fn peers(&self) -> Vec<(ReplicaId, SessionState)> {
        let peers = self.peers.read().await;
        let mut out: Vec<_> = peers.iter().map(|(id, state)| (*id, *state)).collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Join `replica`'s namespace on `bus`.
pub async fn join(bus: &TopicBus, replica: Replica, config: PubSubConfig) -> PubSubHandle {
    let namespace = replica.namespace().to_string();
    let states = bus.get_or_create(&states_topic(&namespace)).await;
    let ops = bus.get_or_create(&ops_topic(&namespace)).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let peers = Arc::new(RwLock::new(HashMap::new()));
    let member = Member {
        states_rx: states.subscribe(),
        ops_rx: ops.subscribe(),
        events: replica.subscribe(),
        states,
        ops,
        replica,
        sessions: HashMap::new(),
        peers: peers.clone(),
    };
    let task = tokio::spawn(member.run(config, shutdown_rx));

    PubSubHandle {
        shutdown: shutdown_tx,
        task,
        peers,
        bus: bus.clone(),
        namespace,
    }
}

struct Member {
    replica: Replica,
    states: Arc<Topic>,
    ops: Arc<Topic>,
    states_rx: Receiver<TopicMessage>,
    ops_rx: Receiver<TopicMessage>,
    events: Receiver<LogEvent>,
    sessions: HashMap<ReplicaId, SyncSession>,
    peers: Arc<RwLock<HashMap<ReplicaId, SessionState>>>,
}

impl Member {
    async fn run(mut self, config: PubSubConfig, mut shutdown: watch::Receiver<bool>) {
        let me = self.replica.replica_id();
        let namespace = self.replica.namespace().to_string();

        tokio::select! {
            _ = tokio::time::sleep(config.settle_delay) => {}
            _ = shutdown.changed() => return,
        }
        info!("Replica {me} joined {namespace}");
        let clock = self.replica.vclock();
        self.publish(vec![Outbound::Sync(clock)]);

        loop {
            let outbound = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }

                msg = self.states_rx.recv() => match msg {
                    Ok(m) if m.from == me => continue,
                    Ok(m) => match serde_json::from_slice::<VClock>(&m.data) {
                        Ok(clock) => self.session(m.from).on_sync(clock),
                        Err(e) => {
                            warn!("Dropping malformed clock from {}: {e}", m.from);
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(n)) => {
                        warn!("Missed {n} state messages on {namespace}, resyncing");
                        vec![Outbound::Sync(self.replica.vclock())]
                    }
                    Err(RecvError::Closed) => break,
                },

                msg = self.ops_rx.recv() => match msg {
                    Ok(m) if m.from == me => continue,
                    Ok(m) => match serde_json::from_slice::<Vec<Op>>(&m.data) {
                        Ok(ops) => self.session(m.from).on_diff(&ops),
                        Err(e) => {
                            warn!("Dropping malformed diff from {}: {e}", m.from);
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(n)) => {
                        warn!("Missed {n} op messages on {namespace}, resyncing");
                        vec![Outbound::Sync(self.replica.vclock())]
                    }
                    Err(RecvError::Closed) => break,
                },

                event = self.events.recv() => match event {
                    Ok(LogEvent::Update(ops)) => {
                        for session in self.sessions.values_mut() {
                            session.note_sent(&ops);
                        }
                        vec![Outbound::Diff(ops.to_vec())]
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Missed {n} log events, resyncing");
                        vec![Outbound::Sync(self.replica.vclock())]
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            self.publish(outbound);
            self.record_peers().await;
        }

        info!("Replica {me} left {namespace}");
    }

    fn session(&mut self, peer: ReplicaId) -> &mut SyncSession {
        let replica = &self.replica;
        self.sessions.entry(peer).or_insert_with(|| {
            debug!("First message from peer {peer}");
            let mut session = SyncSession::new(replica.clone());
            session.attach();
            session
        })
    }

    fn publish(&self, outbound: Vec<Outbound>) {
        let me = self.replica.replica_id();
        for out in outbound {
            let (topic, encoded) = match &out {
                Outbound::Sync(clock) => (&self.states, serde_json::to_vec(clock)),
                Outbound::Diff(ops) => (&self.ops, serde_json::to_vec(ops)),
            };
            match encoded {
                Ok(data) => {
                    topic.publish(me, data);
                }
                Err(e) => warn!("Failed to encode message for {}: {e}", topic.name()),
            }
        }
    }

    async fn record_peers(&self) {
        let mut peers = self.peers.write().await;
        for (id, session) in &self.sessions {
            peers.insert(*id, session.state());
        }
    }
}
