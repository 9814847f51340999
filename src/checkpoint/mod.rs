//! Milestone checkpoints and durable recovery
//!
//! A swap checkpoints once per milestone, and never acts on a milestone
//! before its checkpoint write has completed. Records are write-once: a
//! second write to the same (swap, owner, tag) key means two histories are
//! being driven for one swap, and the daemon halts that swap instead of
//! overwriting. walletd shares the table under its own owner tag; the
//! daemon only reads and writes Swap-owned rows.

pub mod store;

pub use store::{CheckpointEntry, CheckpointStore};

use crate::protocol::{
    Address, BuyProcedureSignature, CoreArbitratingSetup, ProtocolMsg, RefundProcedureSignatures,
    SignedTx, SwapId, SwapParams, TxLabel,
};
use crate::swap::state::SwapState;
use crate::syncer::WatchSpec;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Milestones a swap checkpoints at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTag {
    AlicePreLock,
    AlicePreBuy,
    BobPreLock,
    BobPreBuy,
}

impl CheckpointTag {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointTag::AlicePreLock => "alice_pre_lock",
            CheckpointTag::AlicePreBuy => "alice_pre_buy",
            CheckpointTag::BobPreLock => "bob_pre_lock",
            CheckpointTag::BobPreBuy => "bob_pre_buy",
        }
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CheckpointTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alice_pre_lock" => Ok(CheckpointTag::AlicePreLock),
            "alice_pre_buy" => Ok(CheckpointTag::AlicePreBuy),
            "bob_pre_lock" => Ok(CheckpointTag::BobPreLock),
            "bob_pre_buy" => Ok(CheckpointTag::BobPreBuy),
            other => Err(format!("unknown checkpoint tag: {}", other)),
        }
    }
}

/// Which daemon owns a checkpoint row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointOwner {
    Swap,
    Wallet,
}

impl CheckpointOwner {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointOwner::Swap => "swap",
            CheckpointOwner::Wallet => "wallet",
        }
    }
}

impl fmt::Display for CheckpointOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CheckpointOwner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swap" => Ok(CheckpointOwner::Swap),
            "wallet" => Ok(CheckpointOwner::Wallet),
            other => Err(format!("unknown checkpoint owner: {}", other)),
        }
    }
}

/// Transaction artifacts accumulated so far, as received from walletd and
/// the peer. Opaque beyond labels and txids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwapArtifacts {
    pub funding_address: Option<Address>,
    pub accordant_address: Option<Address>,
    pub core_arbitrating_setup: Option<CoreArbitratingSetup>,
    pub refund_procedure_signatures: Option<RefundProcedureSignatures>,
    pub buy_procedure_signature: Option<BuyProcedureSignature>,
    /// Fully signed templates, by label
    pub signed: BTreeMap<TxLabel, SignedTx>,
    pub fee_estimate: Option<u64>,
}

/// Everything needed to resume a swap where it left off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub swap_id: SwapId,
    pub params: SwapParams,
    pub state: SwapState,
    pub artifacts: SwapArtifacts,
    /// Buffered early messages, in delivery order
    pub pending: Vec<ProtocolMsg>,
    /// Outstanding watches; restore re-registers exactly these
    pub watches: Vec<WatchSpec>,
    /// Labels broadcast before this snapshot; restore never re-sends them
    pub broadcasts: Vec<TxLabel>,
    /// Legs whose funding was already observed
    pub funded_legs: Vec<crate::protocol::SwapLeg>,
    pub created_at: DateTime<Utc>,
}
