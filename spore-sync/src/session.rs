//! Per-peer reconciliation state machine, independent of the transport.
//!
//! ```text
//!                 open()                 local clock == remote clock
//! Disconnected ──────────► NotSynced ──► Syncing ─────────────────────► Synced
//!      ▲                                   ▲                              │
//!      │ close()                           └──── new ops on either side ──┘
//! ```
//!
//! Inputs are remote SYNC/DIFF messages and local `Update` events. Each
//! input yields zero or more [`Outbound`] messages for the transport.
//!
//! Rules:
//! - SYNC in: answer with our clock unless it equals theirs or equals the
//!   last clock we sent; send a DIFF when they are missing anything.
//! - DIFF in: apply. A causal gap triggers a fresh SYNC.
//! - Local update: forward as a DIFF.
//! - Ops merged from another peer: relay what this peer is known to lack.

use log::{debug, trace, warn};
use spore_core::{LogError, Op, Replica, ReplicaId, VClock};

use crate::protocol::{MessageKind, ProtocolError, WireMessage};

/// Session state as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    NotSynced,
    Syncing,
    Synced,
}

/// A message the transport should deliver to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Sync(VClock),
    Diff(Vec<Op>),
}

impl Outbound {
    pub fn to_wire(&self, topic: &str, identity: ReplicaId) -> Result<WireMessage, ProtocolError> {
        match self {
            Outbound::Sync(clock) => WireMessage::sync(topic, identity, clock),
            Outbound::Diff(ops) => WireMessage::diff(topic, identity, ops),
        }
    }
}

/// Sync state for one peer.
pub struct SyncSession {
    replica: Replica,
    state: SessionState,
    /// Last clock we announced to this peer
    last_sent: Option<VClock>,
    /// Our view of what the peer holds
    remote: Option<VClock>,
}

impl SyncSession {
    pub fn new(replica: Replica) -> Self {
        Self {
            replica,
            state: SessionState::Disconnected,
            last_sent: None,
            remote: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn remote_clock(&self) -> Option<&VClock> {
        self.remote.as_ref()
    }

    /// Mark the transport as connected without announcing anything.
    pub fn attach(&mut self) {
        if self.state == SessionState::Disconnected {
            self.state = SessionState::NotSynced;
        }
    }

    /// Mark the transport as connected and announce our clock.
    pub fn open(&mut self) -> Vec<Outbound> {
        self.attach();
        self.state = SessionState::Syncing;
        vec![self.announce()]
    }

    /// Announce our clock again regardless of what was sent before.
    pub fn resync(&mut self) -> Outbound {
        if self.state != SessionState::Disconnected {
            self.state = SessionState::Syncing;
        }
        self.announce()
    }

    pub fn close(&mut self) {
        self.state = SessionState::Disconnected;
        self.last_sent = None;
        self.remote = None;
    }

    fn announce(&mut self) -> Outbound {
        let clock = self.replica.vclock();
        self.last_sent = Some(clock.clone());
        Outbound::Sync(clock)
    }

    /// Dispatch a decoded wire message.
    ///
    /// Messages for another topic, echoes of our own identity and unknown
    /// kinds are dropped.
    pub fn handle(&mut self, msg: &WireMessage) -> Vec<Outbound> {
        if self.state == SessionState::Disconnected {
            debug!("Session closed, dropping {:?} from {}", msg.kind, msg.identity);
            return Vec::new();
        }
        if msg.topic != self.replica.namespace() {
            debug!("Dropping message for foreign topic {}", msg.topic);
            return Vec::new();
        }
        if msg.sender() == Some(self.replica.replica_id()) {
            trace!("Skipping own message");
            return Vec::new();
        }

        match msg.kind {
            MessageKind::Sync => match msg.clock() {
                Ok(clock) => self.on_sync(clock),
                Err(e) => {
                    warn!("Dropping malformed sync from {}: {e}", msg.identity);
                    Vec::new()
                }
            },
            MessageKind::Diff => match msg.ops() {
                Ok(ops) => self.on_diff(&ops),
                Err(e) => {
                    warn!("Dropping malformed diff from {}: {e}", msg.identity);
                    Vec::new()
                }
            },
            MessageKind::Unknown => {
                warn!("No handler for message kind from {}, dropping", msg.identity);
                Vec::new()
            }
        }
    }

    /// The peer announced `remote` as its clock.
    pub fn on_sync(&mut self, remote: VClock) -> Vec<Outbound> {
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }

        let local = self.replica.vclock();
        let mut out = Vec::new();
        if local != remote && self.last_sent.as_ref() != Some(&local) {
            out.push(self.announce());
        }

        let mut known = remote;
        if local.has_news_for(&known) {
            let diff = self.replica.diff(&known);
            debug!("Sending {} ops to peer", diff.len());
            known.merge(&local);
            out.push(Outbound::Diff(diff));
        }
        self.remote = Some(known);
        self.refresh_state();
        out
    }

    /// The peer sent ops.
    pub fn on_diff(&mut self, ops: &[Op]) -> Vec<Outbound> {
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }

        match self.replica.apply(ops) {
            Ok(merged) => {
                debug!("Merged {merged} of {} ops from peer", ops.len());
                self.observe(ops);
                self.refresh_state();
                Vec::new()
            }
            Err(e @ LogError::OutOfOrder { .. }) => {
                warn!("Potential out-of-order diff ({e}), requesting resync");
                vec![self.resync()]
            }
            Err(e) => {
                warn!("Failed to apply diff: {e}");
                Vec::new()
            }
        }
    }

    /// Ops were committed locally: forward them.
    pub fn on_local_update(&mut self, ops: &[Op]) -> Vec<Outbound> {
        if self.state == SessionState::Disconnected || ops.is_empty() {
            return Vec::new();
        }
        self.note_sent(ops);
        vec![Outbound::Diff(ops.to_vec())]
    }

    /// Ops from some other peer were merged into our log. Send this peer
    /// whatever it is known to lack, once its clock has been heard.
    pub fn on_remote_merge(&mut self) -> Vec<Outbound> {
        if self.state == SessionState::Disconnected {
            return Vec::new();
        }
        let Some(remote) = self.remote.clone() else {
            return Vec::new();
        };
        if remote.dominates(&self.replica.vclock()) {
            return Vec::new();
        }
        let diff = self.replica.diff(&remote);
        debug!("Relaying {} merged ops to peer", diff.len());
        self.note_sent(&diff);
        vec![Outbound::Diff(diff)]
    }

    /// Record that `ops` went out to this peer through some other path.
    pub fn note_sent(&mut self, ops: &[Op]) {
        self.observe(ops);
        if self.state != SessionState::Disconnected {
            self.refresh_state();
        }
    }

    fn observe(&mut self, ops: &[Op]) {
        if let Some(remote) = self.remote.as_mut() {
            for op in ops {
                remote.observe(op.replica, op.seq);
            }
        }
    }

    fn refresh_state(&mut self) {
        let local = self.replica.vclock();
        self.state = match &self.remote {
            Some(remote) if *remote == local => SessionState::Synced,
            _ => SessionState::Syncing,
        };
    }
}
