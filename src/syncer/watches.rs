//! Per-swap watch registration bookkeeping
//!
//! Tracks which watches a swap has outstanding so that re-registration is a
//! no-op merge and only the first finality signal per transaction reaches the
//! state machine. Watch identity is logical - keyed by what is being watched
//! (label, timelock kind), never by transaction bytes, because a replayed
//! swap may re-derive the same transaction with different bytes.

use super::{SyncerTask, TaskId, TimelockKind};
use crate::protocol::{Address, SwapLeg, TxId, TxLabel};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// What a watch observes, independent of its syncerd task id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchSpec {
    Height,
    Transaction {
        label: TxLabel,
        txid: TxId,
        finality: u32,
    },
    Address {
        label: TxLabel,
        leg: SwapLeg,
        address: Address,
        finality: u32,
    },
    Timelock {
        kind: TimelockKind,
        valid_from_height: u64,
    },
}

impl WatchSpec {
    fn key(&self) -> WatchKey {
        match self {
            WatchSpec::Height => WatchKey::Height,
            WatchSpec::Transaction { label, .. } => WatchKey::Transaction(*label),
            WatchSpec::Address { label, .. } => WatchKey::Address(*label),
            WatchSpec::Timelock { kind, .. } => WatchKey::Timelock(*kind),
        }
    }

    /// Short form for logs
    pub fn describe(&self) -> String {
        match self {
            WatchSpec::Height => "height".to_string(),
            WatchSpec::Transaction { label, .. } => format!("tx:{}", label),
            WatchSpec::Address { label, .. } => format!("address:{}", label),
            WatchSpec::Timelock { kind, .. } => format!("timelock:{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum WatchKey {
    Height,
    Transaction(TxLabel),
    Address(TxLabel),
    Timelock(TimelockKind),
}

/// Registration and delivery bookkeeping for one swap's watches
#[derive(Debug, Default)]
pub struct WatchSet {
    next_id: u32,
    registered: BTreeMap<WatchKey, (TaskId, WatchSpec)>,
    delivered: BTreeSet<WatchKey>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a checkpoint snapshot, returning the re-registration
    /// tasks. Syncerd treats re-registration of a live watch as a merge, so
    /// sending all of them is safe.
    pub fn restore(specs: Vec<WatchSpec>) -> (Self, Vec<SyncerTask>) {
        let mut set = Self::new();
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Some(task) = set.register(spec) {
                tasks.push(task);
            }
        }
        (set, tasks)
    }

    /// Register a watch, allocating a task id. Returns None when an
    /// equivalent watch is already outstanding - the merge no-op.
    pub fn register(&mut self, spec: WatchSpec) -> Option<SyncerTask> {
        let key = spec.key();
        if self.registered.contains_key(&key) {
            debug!(watch = %spec.describe(), "Watch already registered - merging");
            return None;
        }

        self.next_id += 1;
        let id = TaskId(self.next_id);
        let task = match &spec {
            WatchSpec::Height => SyncerTask::WatchHeight { id },
            WatchSpec::Transaction {
                label,
                txid,
                finality,
            } => SyncerTask::WatchTransaction {
                id,
                label: *label,
                txid: *txid,
                finality: *finality,
            },
            WatchSpec::Address {
                label,
                leg,
                address,
                finality,
            } => SyncerTask::WatchAddress {
                id,
                label: *label,
                leg: *leg,
                address: address.clone(),
                finality: *finality,
            },
            WatchSpec::Timelock {
                kind,
                valid_from_height,
            } => SyncerTask::WatchTimelock {
                id,
                kind: *kind,
                valid_from_height: *valid_from_height,
            },
        };
        self.registered.insert(key, (id, spec));
        Some(task)
    }

    /// Allocate a task id for a one-shot task (broadcast, fee estimate)
    pub fn allocate_id(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    pub fn is_watching_tx(&self, label: TxLabel) -> bool {
        self.registered
            .contains_key(&WatchKey::Transaction(label))
    }

    /// Record a finality delivery for a transaction label. Returns true the
    /// first time; repeats are dropped by the caller.
    pub fn note_tx_final(&mut self, label: TxLabel) -> bool {
        self.delivered.insert(WatchKey::Transaction(label))
    }

    /// Record an address-funded delivery. Same first-wins contract.
    pub fn note_address_funded(&mut self, label: TxLabel) -> bool {
        self.delivered.insert(WatchKey::Address(label))
    }

    /// Record a timelock-expiry delivery. Same first-wins contract.
    pub fn note_timelock(&mut self, kind: TimelockKind) -> bool {
        self.delivered.insert(WatchKey::Timelock(kind))
    }

    /// Outstanding specs, for checkpoint snapshots
    pub fn outstanding(&self) -> Vec<WatchSpec> {
        self.registered.values().map(|(_, s)| s.clone()).collect()
    }

    /// Drain all registrations into abort tasks for terminal cleanup
    pub fn drain_abort_tasks(&mut self) -> Vec<SyncerTask> {
        let tasks = self
            .registered
            .values()
            .map(|(id, _)| SyncerTask::Abort { id: *id })
            .collect();
        self.registered.clear();
        tasks
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}
