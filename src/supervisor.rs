//! Supervisor control channel types
//!
//! supervisord decides which swaps run: it initiates, restores and aborts
//! them, and relays peer connectivity changes. The coordinator reports back
//! whatever it cannot act on alone - funding that must arrive from outside,
//! terminal outcomes, stalled collaborators, and taker commits for swaps it
//! does not know (offer acceptance is the supervisor's call).

use crate::protocol::{Address, CommitParams, Outcome, SwapId, SwapLeg, SwapParams};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Control requests received from supervisord
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtlRequest {
    /// Start a new swap with negotiated parameters
    InitSwap(Box<SwapParams>),

    /// Resume a swap from its latest checkpoint
    RestoreSwap { swap_id: SwapId },

    /// Abort a swap; honored only before the lock is committed to
    AbortSwap { swap_id: SwapId },

    /// The peer connection for this swap dropped
    PeerUnreachable { swap_id: SwapId },

    /// The peer connection is back
    PeerReconnected { swap_id: SwapId },

    /// Report running swaps via a RunningSwaps notice
    ListSwaps,
}

impl CtlRequest {
    /// Request name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CtlRequest::InitSwap(_) => "init_swap",
            CtlRequest::RestoreSwap { .. } => "restore_swap",
            CtlRequest::AbortSwap { .. } => "abort_swap",
            CtlRequest::PeerUnreachable { .. } => "peer_unreachable",
            CtlRequest::PeerReconnected { .. } => "peer_reconnected",
            CtlRequest::ListSwaps => "list_swaps",
        }
    }
}

/// Notices sent to supervisord
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SupervisorNotice {
    /// A leg needs external funds before the swap can proceed
    FundingRequired {
        swap_id: SwapId,
        leg: SwapLeg,
        address: Address,
        amount: u64,
    },

    /// Previously requested funding arrived
    FundingCompleted { swap_id: SwapId, leg: SwapLeg },

    /// The swap reached a terminal state
    SwapTerminated { swap_id: SwapId, outcome: Outcome },

    /// A collaborator has been unreachable past the configured bound
    SwapStalled { swap_id: SwapId, reason: String },

    /// A taker commit arrived for a swap this daemon is not running
    SwapProposed {
        swap_id: SwapId,
        commit: CommitParams,
    },

    /// Reply to ListSwaps
    RunningSwaps { swaps: Vec<SwapId> },
}

impl SupervisorNotice {
    /// Notice name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorNotice::FundingRequired { .. } => "funding_required",
            SupervisorNotice::FundingCompleted { .. } => "funding_completed",
            SupervisorNotice::SwapTerminated { .. } => "swap_terminated",
            SupervisorNotice::SwapStalled { .. } => "swap_stalled",
            SupervisorNotice::SwapProposed { .. } => "swap_proposed",
            SupervisorNotice::RunningSwaps { .. } => "running_swaps",
        }
    }
}

/// An outstanding funding request
#[derive(Debug, Clone, Serialize)]
pub struct FundingNeed {
    pub swap_id: SwapId,
    pub leg: SwapLeg,
    pub address: Address,
    pub amount: u64,
}

/// Funding requests still waiting on external funds, mirrored off the
/// notice stream so the HTTP API can answer without asking any swap.
/// A swap may wait on both legs at once, so entries key on (swap, leg).
#[derive(Default)]
pub struct FundingBoard {
    waiting: DashMap<(SwapId, SwapLeg), FundingNeed>,
}

impl FundingBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the board from a notice on its way to supervisord
    pub fn observe(&self, notice: &SupervisorNotice) {
        match notice {
            SupervisorNotice::FundingRequired {
                swap_id,
                leg,
                address,
                amount,
            } => {
                self.waiting.insert(
                    (*swap_id, *leg),
                    FundingNeed {
                        swap_id: *swap_id,
                        leg: *leg,
                        address: address.clone(),
                        amount: *amount,
                    },
                );
            }
            SupervisorNotice::FundingCompleted { swap_id, leg } => {
                self.waiting.remove(&(*swap_id, *leg));
            }
            SupervisorNotice::SwapTerminated { swap_id, .. } => {
                self.waiting
                    .retain(|(id, _), _| id != swap_id);
            }
            _ => {}
        }
    }

    pub fn waiting(&self) -> Vec<FundingNeed> {
        self.waiting
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required(swap_id: SwapId, leg: SwapLeg) -> SupervisorNotice {
        SupervisorNotice::FundingRequired {
            swap_id,
            leg,
            address: Address("bcrt1qboard".to_string()),
            amount: 50_000,
        }
    }

    #[test]
    fn test_board_tracks_required_until_completed() {
        let board = FundingBoard::new();
        let swap_id = SwapId::random();

        board.observe(&required(swap_id, SwapLeg::Arbitrating));
        assert_eq!(board.waiting().len(), 1);

        board.observe(&SupervisorNotice::FundingCompleted {
            swap_id,
            leg: SwapLeg::Arbitrating,
        });
        assert!(board.is_empty());
    }

    #[test]
    fn test_board_keeps_legs_separate() {
        let board = FundingBoard::new();
        let swap_id = SwapId::random();

        board.observe(&required(swap_id, SwapLeg::Arbitrating));
        board.observe(&required(swap_id, SwapLeg::Accordant));
        assert_eq!(board.waiting().len(), 2);

        board.observe(&SupervisorNotice::FundingCompleted {
            swap_id,
            leg: SwapLeg::Accordant,
        });
        let left = board.waiting();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].leg, SwapLeg::Arbitrating);
    }

    #[test]
    fn test_termination_clears_every_leg() {
        let board = FundingBoard::new();
        let swap_id = SwapId::random();
        let other = SwapId::random();

        board.observe(&required(swap_id, SwapLeg::Arbitrating));
        board.observe(&required(swap_id, SwapLeg::Accordant));
        board.observe(&required(other, SwapLeg::Accordant));

        board.observe(&SupervisorNotice::SwapTerminated {
            swap_id,
            outcome: Outcome::Abort,
        });
        let left = board.waiting();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].swap_id, other);
    }
}
