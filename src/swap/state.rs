//! Swap machine states
//!
//! States carry the minimal flags needed to make once-only effects survive a
//! checkpoint replay: anything that must fire exactly once per swap lives in
//! the state payload and serializes with it, never in runtime memory alone.

use crate::protocol::{Outcome, SwapRole};

use serde::{Deserialize, Serialize};
use std::fmt;

/// States driven by a Bob-role coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BobState {
    /// Created, nothing exchanged yet
    StartB,
    /// Local commitment sent, awaiting counterparty material
    CommitB,
    /// Both sides committed; reveals in flight
    RevealB,
    /// Core arbitrating setup sent to Alice, awaiting her signatures
    CorearbB,
    /// Buy signature produced and held; lock broadcast
    BuySigB {
        lock_final: bool,
        buy_sig_released: bool,
    },
    /// Cancel path: waiting to reclaim the arbitrating funds
    CancelB {
        cancel_broadcast: bool,
        cancel_final: bool,
    },
    /// Terminal
    FinishB(Outcome),
}

impl BobState {
    pub fn name(&self) -> &'static str {
        match self {
            BobState::StartB => "StartB",
            BobState::CommitB => "CommitB",
            BobState::RevealB => "RevealB",
            BobState::CorearbB => "CorearbB",
            BobState::BuySigB { .. } => "BuySigB",
            BobState::CancelB { .. } => "CancelB",
            BobState::FinishB(_) => "FinishB",
        }
    }
}

/// States driven by an Alice-role coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AliceState {
    /// Created, nothing exchanged yet
    StartA,
    /// Local commitment sent, awaiting counterparty material
    CommitA,
    /// Both sides committed; reveals in flight
    RevealA,
    /// Refund signatures sent to Bob; watching the arbitrating lock
    RefundSigA { lock_final: bool, buy_received: bool },
    /// Cancel path: refund-observation, punish armed by the timelock
    CancelA {
        cancel_broadcast: bool,
        cancel_final: bool,
    },
    /// Punish broadcast, awaiting confirmation
    PunishA,
    /// Terminal
    FinishA(Outcome),
}

impl AliceState {
    pub fn name(&self) -> &'static str {
        match self {
            AliceState::StartA => "StartA",
            AliceState::CommitA => "CommitA",
            AliceState::RevealA => "RevealA",
            AliceState::RefundSigA { .. } => "RefundSigA",
            AliceState::CancelA { .. } => "CancelA",
            AliceState::PunishA => "PunishA",
            AliceState::FinishA(_) => "FinishA",
        }
    }
}

/// Role-tagged swap state, the unit persisted in checkpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SwapState {
    Alice(AliceState),
    Bob(BobState),
}

impl SwapState {
    /// Initial state for a role
    pub fn start(role: SwapRole) -> Self {
        match role {
            SwapRole::Alice => SwapState::Alice(AliceState::StartA),
            SwapRole::Bob => SwapState::Bob(BobState::StartB),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SwapState::Alice(s) => s.name(),
            SwapState::Bob(s) => s.name(),
        }
    }

    pub fn role(&self) -> SwapRole {
        match self {
            SwapState::Alice(_) => SwapRole::Alice,
            SwapState::Bob(_) => SwapRole::Bob,
        }
    }

    /// Terminal outcome, if the swap has finished
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            SwapState::Alice(AliceState::FinishA(o)) => Some(*o),
            SwapState::Bob(BobState::FinishB(o)) => Some(*o),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            Some(outcome) => write!(f, "{}({})", self.name(), outcome),
            None => write!(f, "{}", self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_states_match_roles() {
        assert_eq!(SwapState::start(SwapRole::Bob).name(), "StartB");
        assert_eq!(SwapState::start(SwapRole::Alice).name(), "StartA");
        assert_eq!(SwapState::start(SwapRole::Bob).role(), SwapRole::Bob);
    }

    #[test]
    fn test_terminal_detection() {
        let state = SwapState::Bob(BobState::FinishB(Outcome::Refund));
        assert!(state.is_terminal());
        assert_eq!(state.outcome(), Some(Outcome::Refund));
        assert_eq!(state.to_string(), "FinishB(refund)");

        let state = SwapState::Bob(BobState::BuySigB {
            lock_final: false,
            buy_sig_released: false,
        });
        assert!(!state.is_terminal());
        assert_eq!(state.outcome(), None);
    }

    #[test]
    fn test_state_flags_survive_serde() {
        let state = SwapState::Alice(AliceState::RefundSigA {
            lock_final: true,
            buy_received: false,
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: SwapState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
