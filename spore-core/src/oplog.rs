//! The replicated, append-only fact log.
//!
//! ```text
//!  append(fact) ──► Op { replica, seq, lamport, fact }
//!                     │
//!  apply(ops)  ──►  validate whole batch ──► merge in (lamport, replica) order
//!                     │ gap?
//!                     └──► LogError::OutOfOrder, log untouched
//! ```
//!
//! `seq` is the writer's own counter and is what the vector clock records.
//! `lamport` gives every replica the same total order over all ops, so
//! "last fact wins" folds converge regardless of delivery order.
//!
//! [`ReplicatedLog`] is the seam other components consume; [`MemoryLog`] is
//! the in-memory implementation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fact::{Fact, ReplicaId};
use crate::vclock::VClock;

/// Hook fired with the ops produced by local appends.
pub type UpdateHook = Box<dyn Fn(&[Op]) + Send + Sync>;

/// Hook fired after remote ops were merged.
pub type ApplyHook = Box<dyn Fn() + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// Ops reference causal history this log has not seen yet.
    #[error("Out of order op from replica {replica}: expected seq {expected}, got {got}")]
    OutOfOrder {
        replica: ReplicaId,
        expected: u64,
        got: u64,
    },
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// A fact as stored in the log, stamped with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub replica: ReplicaId,
    pub seq: u64,
    pub lamport: u64,
    pub fact: Fact,
}

impl Op {
    fn order_key(&self) -> (u64, ReplicaId) {
        (self.lamport, self.replica)
    }
}

/// Operations the sync and store layers need from a replicated log.
pub trait ReplicatedLog: Send {
    /// Writer identity of this log.
    fn replica(&self) -> ReplicaId;

    /// Append a local fact.
    fn append(&mut self, fact: Fact) -> Op;

    /// Merge remote ops. Returns how many were new.
    fn apply(&mut self, ops: &[Op]) -> Result<usize, LogError>;

    /// Ops not reflected by `clock`, in log order.
    fn diff(&self, clock: &VClock) -> Vec<Op>;

    fn vclock(&self) -> VClock;

    /// Every fact in log order.
    fn snapshot(&self) -> Vec<Fact>;

    /// While enabled, appends are buffered and announced once on disable.
    fn set_aggregation(&mut self, enabled: bool);

    fn set_on_update(&mut self, hook: UpdateHook);

    fn unset_on_update(&mut self);

    fn set_on_apply(&mut self, hook: ApplyHook);
}

/// In-memory replicated log.
pub struct MemoryLog {
    replica: ReplicaId,
    clock: VClock,
    lamport: u64,
    /// Sorted by `(lamport, replica)`
    ops: Vec<Op>,
    aggregating: bool,
    pending: Vec<Op>,
    on_update: Option<UpdateHook>,
    on_apply: Option<ApplyHook>,
}

impl MemoryLog {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: VClock::new(),
            lamport: 0,
            ops: Vec::new(),
            aggregating: false,
            pending: Vec::new(),
            on_update: None,
            on_apply: None,
        }
    }

    /// Number of ops held.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    fn insert(&mut self, op: Op) {
        self.lamport = self.lamport.max(op.lamport);
        let key = op.order_key();
        let pos = self.ops.partition_point(|o| o.order_key() <= key);
        self.ops.insert(pos, op);
    }

    fn announce(&self, ops: &[Op]) {
        if let Some(hook) = &self.on_update {
            hook(ops);
        }
    }
}

impl ReplicatedLog for MemoryLog {
    fn replica(&self) -> ReplicaId {
        self.replica
    }

    fn append(&mut self, fact: Fact) -> Op {
        let seq = self.clock.increment(self.replica);
        let op = Op {
            replica: self.replica,
            seq,
            lamport: self.lamport.saturating_add(1),
            fact,
        };
        self.insert(op.clone());

        if self.aggregating {
            self.pending.push(op.clone());
        } else {
            self.announce(std::slice::from_ref(&op));
        }
        op
    }

    fn apply(&mut self, ops: &[Op]) -> Result<usize, LogError> {
        let mut fresh: Vec<&Op> = ops
            .iter()
            .filter(|op| op.seq > self.clock.get(op.replica))
            .collect();
        fresh.sort_by_key(|op| (op.replica, op.seq));
        fresh.dedup_by_key(|op| (op.replica, op.seq));

        // Validate before touching anything so a gap leaves the log as it was.
        let mut next_clock = self.clock.clone();
        for op in &fresh {
            if op.lamport == u64::MAX {
                return Err(LogError::Encoding(format!(
                    "op {}:{} carries an exhausted lamport clock",
                    op.replica, op.seq
                )));
            }
            let expected = next_clock.get(op.replica) + 1;
            if op.seq != expected {
                return Err(LogError::OutOfOrder {
                    replica: op.replica,
                    expected,
                    got: op.seq,
                });
            }
            next_clock.observe(op.replica, op.seq);
        }

        let merged = fresh.len();
        let fresh: Vec<Op> = fresh.into_iter().cloned().collect();
        for op in fresh {
            self.insert(op);
        }
        self.clock = next_clock;

        if merged > 0 {
            if let Some(hook) = &self.on_apply {
                hook();
            }
        }
        Ok(merged)
    }

    fn diff(&self, clock: &VClock) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|op| op.seq > clock.get(op.replica))
            .cloned()
            .collect()
    }

    fn vclock(&self) -> VClock {
        self.clock.clone()
    }

    fn snapshot(&self) -> Vec<Fact> {
        self.ops.iter().map(|op| op.fact.clone()).collect()
    }

    fn set_aggregation(&mut self, enabled: bool) {
        if enabled {
            self.aggregating = true;
            return;
        }
        self.aggregating = false;
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            self.announce(&pending);
        }
    }

    fn set_on_update(&mut self, hook: UpdateHook) {
        self.on_update = Some(hook);
    }

    fn unset_on_update(&mut self) {
        self.on_update = None;
    }

    fn set_on_apply(&mut self, hook: ApplyHook) {
        self.on_apply = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn fact(entity: &str, attr: &str, value: i64) -> Fact {
        Fact::new(entity, attr, value)
    }

    #[test]
    fn test_append_advances_clock() {
        let mut log = MemoryLog::new(ReplicaId(1));
        let op = log.append(fact("a", "x", 1));
        assert_eq!(op.seq, 1);
        assert_eq!(op.lamport, 1);
        log.append(fact("a", "y", 2));
        assert_eq!(log.vclock().get(ReplicaId(1)), 2);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_diff_against_empty_clock_is_everything() {
        let mut log = MemoryLog::new(ReplicaId(1));
        log.append(fact("a", "x", 1));
        log.append(fact("a", "y", 2));
        assert_eq!(log.diff(&VClock::new()).len(), 2);
        assert!(log.diff(&log.vclock()).is_empty());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut a = MemoryLog::new(ReplicaId(1));
        a.append(fact("a", "x", 1));
        a.append(fact("a", "y", 2));
        let diff = a.diff(&VClock::new());

        let mut b = MemoryLog::new(ReplicaId(2));
        assert_eq!(b.apply(&diff).unwrap(), 2);
        let after_once = b.snapshot();
        assert_eq!(b.apply(&diff).unwrap(), 0);
        assert_eq!(b.snapshot(), after_once);
        assert_eq!(b.vclock(), a.vclock());
    }

    #[test]
    fn test_apply_with_gap_fails_without_mutation() {
        let mut a = MemoryLog::new(ReplicaId(1));
        a.append(fact("a", "x", 1));
        let second = a.append(fact("a", "y", 2));

        let mut b = MemoryLog::new(ReplicaId(2));
        let err = b.apply(&[second]).unwrap_err();
        assert_eq!(
            err,
            LogError::OutOfOrder {
                replica: ReplicaId(1),
                expected: 1,
                got: 2
            }
        );
        assert!(b.is_empty());
        assert!(b.vclock().is_empty());
    }

    #[test]
    fn test_apply_partial_gap_rejects_whole_batch() {
        let mut a = MemoryLog::new(ReplicaId(1));
        let first = a.append(fact("a", "x", 1));
        a.append(fact("a", "y", 2));
        let third = a.append(fact("a", "z", 3));

        let mut b = MemoryLog::new(ReplicaId(2));
        assert!(b.apply(&[first, third]).is_err());
        assert!(b.is_empty());
    }

    #[test]
    fn test_apply_accepts_unsorted_batch() {
        let mut a = MemoryLog::new(ReplicaId(1));
        let first = a.append(fact("a", "x", 1));
        let second = a.append(fact("a", "y", 2));

        let mut b = MemoryLog::new(ReplicaId(2));
        assert_eq!(b.apply(&[second, first]).unwrap(), 2);
        assert_eq!(b.snapshot(), a.snapshot());
    }

    #[test]
    fn test_log_order_converges() {
        let mut a = MemoryLog::new(ReplicaId(1));
        let mut b = MemoryLog::new(ReplicaId(2));
        a.append(fact("e", "x", 1));
        b.append(fact("e", "x", 2));

        let from_a = a.diff(&VClock::new());
        let from_b = b.diff(&VClock::new());
        a.apply(&from_b).unwrap();
        b.apply(&from_a).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.vclock(), b.vclock());
    }

    #[test]
    fn test_lamport_follows_remote_history() {
        let mut a = MemoryLog::new(ReplicaId(1));
        a.append(fact("e", "x", 1));
        a.append(fact("e", "x", 2));

        let mut b = MemoryLog::new(ReplicaId(2));
        b.apply(&a.diff(&VClock::new())).unwrap();
        let op = b.append(fact("e", "x", 3));
        assert_eq!(op.lamport, 3);
        assert_eq!(b.snapshot().last().unwrap().value, serde_json::json!(3));
    }

    #[test]
    fn test_apply_rejects_exhausted_lamport() {
        let hostile = Op {
            replica: ReplicaId(9),
            seq: 1,
            lamport: u64::MAX,
            fact: fact("e", "x", 1),
        };

        let mut log = MemoryLog::new(ReplicaId(1));
        assert!(matches!(log.apply(&[hostile]), Err(LogError::Encoding(_))));
        assert!(log.is_empty());
        assert!(log.vclock().is_empty());

        let op = log.append(fact("e", "x", 2));
        assert_eq!(op.lamport, 1);
    }

    #[test]
    fn test_append_saturates_at_lamport_ceiling() {
        let near_max = Op {
            replica: ReplicaId(9),
            seq: 1,
            lamport: u64::MAX - 1,
            fact: fact("e", "x", 1),
        };

        let mut log = MemoryLog::new(ReplicaId(1));
        assert_eq!(log.apply(&[near_max]).unwrap(), 1);
        assert_eq!(log.append(fact("e", "x", 2)).lamport, u64::MAX);
        assert_eq!(log.append(fact("e", "x", 3)).lamport, u64::MAX);
        assert_eq!(log.snapshot().last().unwrap().value, serde_json::json!(3));
    }

    #[test]
    fn test_aggregation_announces_once() {
        let mut log = MemoryLog::new(ReplicaId(1));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        log.set_on_update(Box::new(move |ops| {
            sink.lock().unwrap().push(ops.len());
        }));

        log.set_aggregation(true);
        log.append(fact("a", "x", 1));
        log.append(fact("a", "y", 2));
        log.append(fact("a", "z", 3));
        assert!(batches.lock().unwrap().is_empty());
        log.set_aggregation(false);

        assert_eq!(*batches.lock().unwrap(), vec![3]);
    }

    #[test]
    fn test_append_without_aggregation_announces_each() {
        let mut log = MemoryLog::new(ReplicaId(1));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        log.set_on_update(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        log.append(fact("a", "x", 1));
        log.append(fact("a", "y", 2));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        log.unset_on_update();
        log.append(fact("a", "z", 3));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_apply_hook_fires_only_on_new_ops() {
        let mut a = MemoryLog::new(ReplicaId(1));
        a.append(fact("a", "x", 1));
        let diff = a.diff(&VClock::new());

        let mut b = MemoryLog::new(ReplicaId(2));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        b.set_on_apply(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        b.apply(&diff).unwrap();
        b.apply(&diff).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
