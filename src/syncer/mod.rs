//! Chain watcher tasks and events
//!
//! The daemon never talks to a blockchain directly: it registers watch and
//! broadcast tasks with syncerd and reacts to the events syncerd sends back.
//! Timed aborts ride entirely on those events - the coordinator hands the
//! relevant heights over at registration time and never consults a clock.

pub mod watches;

pub use watches::{WatchSet, WatchSpec};

use crate::protocol::{Address, SignedTx, SwapId, SwapLeg, TxId, TxLabel};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a task registered with syncerd, unique per swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which timelock a watch refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimelockKind {
    Cancel,
    Punish,
}

impl TimelockKind {
    pub fn name(&self) -> &'static str {
        match self {
            TimelockKind::Cancel => "cancel",
            TimelockKind::Punish => "punish",
        }
    }
}

impl fmt::Display for TimelockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tasks sent to syncerd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncerTask {
    /// Report height changes on the arbitrating chain
    WatchHeight { id: TaskId },

    /// Watch a transaction until it reaches the given confirmation depth
    WatchTransaction {
        id: TaskId,
        label: TxLabel,
        txid: TxId,
        finality: u32,
    },

    /// Watch an address for incoming funds
    WatchAddress {
        id: TaskId,
        label: TxLabel,
        leg: SwapLeg,
        address: Address,
        finality: u32,
    },

    /// Report when the chain passes the given height
    WatchTimelock {
        id: TaskId,
        kind: TimelockKind,
        valid_from_height: u64,
    },

    /// Broadcast a fully signed transaction
    Broadcast { id: TaskId, tx: SignedTx },

    /// One-shot fee estimate for the arbitrating chain
    EstimateFee { id: TaskId },

    /// Deregister a previously registered task
    Abort { id: TaskId },
}

impl SyncerTask {
    /// Task name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SyncerTask::WatchHeight { .. } => "watch_height",
            SyncerTask::WatchTransaction { .. } => "watch_transaction",
            SyncerTask::WatchAddress { .. } => "watch_address",
            SyncerTask::WatchTimelock { .. } => "watch_timelock",
            SyncerTask::Broadcast { .. } => "broadcast",
            SyncerTask::EstimateFee { .. } => "estimate_fee",
            SyncerTask::Abort { .. } => "abort",
        }
    }

    pub fn id(&self) -> TaskId {
        match self {
            SyncerTask::WatchHeight { id }
            | SyncerTask::WatchTransaction { id, .. }
            | SyncerTask::WatchAddress { id, .. }
            | SyncerTask::WatchTimelock { id, .. }
            | SyncerTask::Broadcast { id, .. }
            | SyncerTask::EstimateFee { id }
            | SyncerTask::Abort { id } => *id,
        }
    }
}

/// Events received from syncerd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncerEvent {
    /// New arbitrating-chain height
    HeightChanged { height: u64 },

    /// Watched transaction appeared in the mempool
    TransactionSeen {
        id: TaskId,
        label: TxLabel,
        txid: TxId,
    },

    /// Confirmation progress for a watched transaction
    TransactionConfirmations {
        id: TaskId,
        label: TxLabel,
        confirmations: u32,
    },

    /// Watched transaction reached its finality depth
    TransactionFinal {
        id: TaskId,
        label: TxLabel,
        txid: TxId,
        height: u64,
    },

    /// Watched address received final funds
    AddressFunded {
        id: TaskId,
        label: TxLabel,
        leg: SwapLeg,
        txid: TxId,
        amount: u64,
    },

    /// Cancel timelock has expired
    CancelValid { height: u64 },

    /// Punish timelock has expired
    PunishValid { height: u64 },

    /// Fee estimate response
    FeeEstimate { sat_per_vbyte: u64 },

    /// Task deregistered
    TaskAborted { id: TaskId },
}

impl SyncerEvent {
    /// Event name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SyncerEvent::HeightChanged { .. } => "height_changed",
            SyncerEvent::TransactionSeen { .. } => "transaction_seen",
            SyncerEvent::TransactionConfirmations { .. } => "transaction_confirmations",
            SyncerEvent::TransactionFinal { .. } => "transaction_final",
            SyncerEvent::AddressFunded { .. } => "address_funded",
            SyncerEvent::CancelValid { .. } => "cancel_valid",
            SyncerEvent::PunishValid { .. } => "punish_valid",
            SyncerEvent::FeeEstimate { .. } => "fee_estimate",
            SyncerEvent::TaskAborted { .. } => "task_aborted",
        }
    }
}

/// Frame carrying a task to syncerd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub swap_id: SwapId,
    pub task: SyncerTask,
}

/// Frame carrying an event back from syncerd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub swap_id: SwapId,
    pub event: SyncerEvent,
}
