//! Deterministic swap transition tables
//!
//! The machine is pure bookkeeping: given the current state and one input it
//! either returns the next state plus the effects to execute, or an error
//! that leaves the state untouched. Every undeclared (state, input) pair is
//! an unexpected event - the caller logs and drops it and the swap carries
//! on. Effects are executed by the runtime in the order returned. Milestone
//! batches put watch registrations first (so the checkpoint snapshot carries
//! them; re-registration is a merge no-op anyway), then the checkpoint, then
//! the irreversible effects (peer sends, broadcasts).

use crate::checkpoint::CheckpointTag;
use crate::error::StateError;
use crate::protocol::{
    BuyProcedureSignature, CommitParams, CoreArbitratingSetup, MsgSource, Outcome, Proof,
    ProtocolMsg, RefundProcedureSignatures, RevealParams, SwapLeg, SwapParams, TradeRole, TxLabel,
};
use crate::swap::state::{AliceState, BobState, SwapState};
use crate::syncer::TimelockKind;

/// Chain signals after runtime translation and deduplication
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainInput {
    TxSeen { label: TxLabel },
    TxFinal { label: TxLabel, height: u64 },
    AccordantLockFunded,
    CancelValid,
    PunishValid,
}

impl ChainInput {
    pub fn describe(&self) -> String {
        match self {
            ChainInput::TxSeen { label } => format!("tx_seen({})", label),
            ChainInput::TxFinal { label, .. } => format!("tx_final({})", label),
            ChainInput::AccordantLockFunded => "accordant_lock_funded".to_string(),
            ChainInput::CancelValid => "cancel_valid".to_string(),
            ChainInput::PunishValid => "punish_valid".to_string(),
        }
    }
}

/// One input to the machine: a local command, a protocol message with its
/// source, or a chain signal
#[derive(Debug, Clone)]
pub enum SwapInput {
    Start,
    Abort,
    Msg { source: MsgSource, msg: ProtocolMsg },
    Chain(ChainInput),
}

impl SwapInput {
    pub fn describe(&self) -> String {
        match self {
            SwapInput::Start => "start".to_string(),
            SwapInput::Abort => "abort".to_string(),
            SwapInput::Msg { source, msg } => format!("{}:{}", source, msg.kind()),
            SwapInput::Chain(chain) => chain.describe(),
        }
    }
}

/// Effects the runtime executes after a successful transition
#[derive(Debug, Clone)]
pub enum Action {
    /// Request the local commitment from walletd and send it to the peer
    ExchangeCommit,
    /// Forward the counterparty commitment to walletd
    ForwardRemoteCommit { commit: CommitParams },
    /// Request the local reveal from walletd and send proof then reveal
    ExchangeReveal,
    /// Forward the counterparty proof to walletd
    ForwardRemoteProof { proof: Proof },
    /// Forward the counterparty reveal to walletd
    ForwardRemoteReveal { reveal: RevealParams },
    /// Bob: request the core arbitrating setup artifact
    RequestCoreArbitratingSetup,
    /// Alice: request refund procedure signatures over Bob's setup
    RequestRefundSignatures { setup: CoreArbitratingSetup },
    /// Bob: request the buy signature artifact from Alice's signatures
    RequestBuySignature {
        signatures: RefundProcedureSignatures,
    },
    /// Request the funding address and surface a funding-required notice
    RequestFundingAddress { leg: SwapLeg },
    /// Request the joint accordant address and watch it
    RequestAccordantAddress,
    /// Send a protocol message to the peer
    SendPeer { msg: ProtocolMsg },
    /// Bob: hand the held buy signature to the peer
    ReleaseBuySig,
    /// Durably record the milestone before anything after it runs
    Checkpoint { tag: CheckpointTag },
    /// Watch arbitrating chain height
    WatchHeight,
    /// Watch a transaction by label; the runtime resolves its txid from the
    /// accumulated artifacts
    WatchTx { label: TxLabel },
    /// Arm a timelock notification
    WatchTimelock {
        kind: TimelockKind,
        valid_from_height: u64,
    },
    /// One-shot fee estimate
    EstimateFee,
    /// Finalize a known template via walletd and broadcast it
    BroadcastTx { label: TxLabel },
    /// Alice: adapt the received buy signature and broadcast the buy
    BroadcastBuy { sig: BuyProcedureSignature },
    /// Deregister all outstanding watches
    AbortWatches,
    /// The swap is over; notify and stop
    Terminated { outcome: Outcome },
}

impl Action {
    /// Action name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Action::ExchangeCommit => "exchange_commit",
            Action::ForwardRemoteCommit { .. } => "forward_remote_commit",
            Action::ExchangeReveal => "exchange_reveal",
            Action::ForwardRemoteProof { .. } => "forward_remote_proof",
            Action::ForwardRemoteReveal { .. } => "forward_remote_reveal",
            Action::RequestCoreArbitratingSetup => "request_core_arbitrating_setup",
            Action::RequestRefundSignatures { .. } => "request_refund_signatures",
            Action::RequestBuySignature { .. } => "request_buy_signature",
            Action::RequestFundingAddress { .. } => "request_funding_address",
            Action::RequestAccordantAddress => "request_accordant_address",
            Action::SendPeer { .. } => "send_peer",
            Action::ReleaseBuySig => "release_buy_sig",
            Action::Checkpoint { .. } => "checkpoint",
            Action::WatchHeight => "watch_height",
            Action::WatchTx { .. } => "watch_tx",
            Action::WatchTimelock { .. } => "watch_timelock",
            Action::EstimateFee => "estimate_fee",
            Action::BroadcastTx { .. } => "broadcast_tx",
            Action::BroadcastBuy { .. } => "broadcast_buy",
            Action::AbortWatches => "abort_watches",
            Action::Terminated { .. } => "terminated",
        }
    }
}

/// The per-swap state machine
#[derive(Debug)]
pub struct SwapMachine {
    params: SwapParams,
    state: SwapState,
}

impl SwapMachine {
    pub fn new(params: SwapParams) -> Self {
        let state = SwapState::start(params.role);
        Self { params, state }
    }

    /// Re-enter a checkpointed state
    pub fn restore(params: SwapParams, state: SwapState) -> Self {
        Self { params, state }
    }

    pub fn state(&self) -> &SwapState {
        &self.state
    }

    pub fn params(&self) -> &SwapParams {
        &self.params
    }

    /// Apply one input. On error the state is untouched.
    pub fn apply(&mut self, input: SwapInput) -> Result<Vec<Action>, StateError> {
        let (next, actions) = match &self.state {
            SwapState::Bob(bob) => self.bob_transition(bob, input)?,
            SwapState::Alice(alice) => self.alice_transition(alice, input)?,
        };
        self.state = next;
        Ok(actions)
    }

    fn unexpected(&self, input: &SwapInput) -> StateError {
        StateError::UnexpectedEvent {
            state: self.state.to_string(),
            input: input.describe(),
        }
    }

    /// Actions shared by both roles at swap start
    fn start_actions(&self) -> Vec<Action> {
        let mut actions = vec![Action::WatchHeight, Action::EstimateFee];
        if let Some(commit) = &self.params.remote_commit {
            actions.push(Action::ForwardRemoteCommit {
                commit: commit.clone(),
            });
        }
        actions.push(Action::ExchangeCommit);
        actions
    }

    fn cancel_timelock_watch(&self, lock_final_height: u64) -> Action {
        Action::WatchTimelock {
            kind: TimelockKind::Cancel,
            valid_from_height: lock_final_height + u64::from(self.params.cancel_timelock),
        }
    }

    fn punish_timelock_watch(&self, cancel_final_height: u64) -> Action {
        Action::WatchTimelock {
            kind: TimelockKind::Punish,
            valid_from_height: cancel_final_height + u64::from(self.params.punish_timelock),
        }
    }

    fn bob_transition(
        &self,
        state: &BobState,
        input: SwapInput,
    ) -> Result<(SwapState, Vec<Action>), StateError> {
        use BobState::*;

        let transition = match (state, input) {
            (StartB, SwapInput::Start) => {
                let mut actions = self.start_actions();
                actions.push(Action::RequestFundingAddress {
                    leg: SwapLeg::Arbitrating,
                });
                (CommitB, actions)
            }

            // Taker: the maker's counter-commitment completes the commit
            // phase and it is our turn to reveal.
            (
                CommitB,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::MakerCommit(commit),
                },
            ) if self.params.trade_role == TradeRole::Taker => (
                RevealB,
                vec![
                    Action::ForwardRemoteCommit { commit },
                    Action::ExchangeReveal,
                ],
            ),

            // Maker: the taker reveals first; answering with our own reveal
            // moves the swap into the reveal phase.
            (
                CommitB,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::RevealProof(proof),
                },
            ) if self.params.trade_role == TradeRole::Maker => (
                RevealB,
                vec![
                    Action::ForwardRemoteProof { proof },
                    Action::ExchangeReveal,
                ],
            ),
            (
                CommitB,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::Reveal(reveal),
                },
            ) if self.params.trade_role == TradeRole::Maker => (
                RevealB,
                vec![
                    Action::ForwardRemoteReveal { reveal },
                    Action::ExchangeReveal,
                    Action::RequestCoreArbitratingSetup,
                ],
            ),

            (
                RevealB,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::RevealProof(proof),
                },
            ) => (RevealB, vec![Action::ForwardRemoteProof { proof }]),
            (
                RevealB,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::Reveal(reveal),
                },
            ) => (
                RevealB,
                vec![
                    Action::ForwardRemoteReveal { reveal },
                    Action::RequestCoreArbitratingSetup,
                ],
            ),

            // The wallet produced our arbitrating transaction set: first
            // milestone. Watches go up before anything can hit the chain.
            (
                RevealB,
                SwapInput::Msg {
                    source: MsgSource::Wallet,
                    msg: ProtocolMsg::CoreArbitratingSetup(setup),
                },
            ) => (
                CorearbB,
                vec![
                    Action::WatchTx {
                        label: TxLabel::Lock,
                    },
                    Action::WatchTx {
                        label: TxLabel::Cancel,
                    },
                    Action::WatchTx {
                        label: TxLabel::Refund,
                    },
                    Action::Checkpoint {
                        tag: CheckpointTag::BobPreLock,
                    },
                    Action::SendPeer {
                        msg: ProtocolMsg::CoreArbitratingSetup(setup),
                    },
                ],
            ),

            (
                CorearbB,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::RefundProcedureSignatures(signatures),
                },
            ) => (CorearbB, vec![Action::RequestBuySignature { signatures }]),

            // Refund path secured: lock can go out. The buy signature stays
            // held until the accordant lock is final.
            (
                CorearbB,
                SwapInput::Msg {
                    source: MsgSource::Wallet,
                    msg: ProtocolMsg::BuyProcedureSignature(_),
                },
            ) => (
                BuySigB {
                    lock_final: false,
                    buy_sig_released: false,
                },
                vec![
                    Action::WatchTx {
                        label: TxLabel::Buy,
                    },
                    Action::Checkpoint {
                        tag: CheckpointTag::BobPreBuy,
                    },
                    Action::BroadcastTx {
                        label: TxLabel::Lock,
                    },
                ],
            ),

            (
                BuySigB { .. },
                SwapInput::Chain(ChainInput::TxSeen {
                    label: TxLabel::Cancel,
                }),
            ) => (
                CancelB {
                    cancel_broadcast: true,
                    cancel_final: false,
                },
                vec![],
            ),
            (state @ BuySigB { .. }, SwapInput::Chain(ChainInput::TxSeen { .. })) => {
                (state.clone(), vec![])
            }

            (
                BuySigB {
                    lock_final: false,
                    buy_sig_released,
                },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Lock,
                    height,
                }),
            ) => (
                BuySigB {
                    lock_final: true,
                    buy_sig_released: *buy_sig_released,
                },
                vec![
                    Action::RequestAccordantAddress,
                    self.cancel_timelock_watch(height),
                ],
            ),

            (
                BuySigB {
                    buy_sig_released: false,
                    lock_final,
                },
                SwapInput::Chain(ChainInput::AccordantLockFunded),
            ) => (
                BuySigB {
                    lock_final: *lock_final,
                    buy_sig_released: true,
                },
                vec![Action::ReleaseBuySig],
            ),

            (
                BuySigB { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Buy,
                    ..
                }),
            ) => (
                FinishB(Outcome::Buy),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Buy,
                    },
                ],
            ),

            (BuySigB { .. }, SwapInput::Chain(ChainInput::CancelValid)) => (
                CancelB {
                    cancel_broadcast: true,
                    cancel_final: false,
                },
                vec![Action::BroadcastTx {
                    label: TxLabel::Cancel,
                }],
            ),
            (
                BuySigB { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Cancel,
                    ..
                }),
            ) => (
                CancelB {
                    cancel_broadcast: true,
                    cancel_final: true,
                },
                vec![Action::BroadcastTx {
                    label: TxLabel::Refund,
                }],
            ),

            (
                CancelB {
                    cancel_broadcast,
                    cancel_final: false,
                },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Cancel,
                    ..
                }),
            ) => (
                CancelB {
                    cancel_broadcast: *cancel_broadcast,
                    cancel_final: true,
                },
                vec![Action::BroadcastTx {
                    label: TxLabel::Refund,
                }],
            ),
            (
                CancelB { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Refund,
                    ..
                }),
            ) => (
                FinishB(Outcome::Refund),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Refund,
                    },
                ],
            ),
            // The buy can still win the race against the cancel path.
            (
                CancelB { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Buy,
                    ..
                }),
            ) => (
                FinishB(Outcome::Buy),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Buy,
                    },
                ],
            ),
            (state @ CancelB { .. }, SwapInput::Chain(ChainInput::TxSeen { .. })) => {
                (state.clone(), vec![])
            }

            // Aborting is only safe while nothing can reach the chain.
            (StartB | CommitB | RevealB | CorearbB, SwapInput::Abort) => (
                FinishB(Outcome::Abort),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Abort,
                    },
                ],
            ),

            (_, input) => return Err(self.unexpected(&input)),
        };

        let (next, actions) = transition;
        Ok((SwapState::Bob(next), actions))
    }

    fn alice_transition(
        &self,
        state: &AliceState,
        input: SwapInput,
    ) -> Result<(SwapState, Vec<Action>), StateError> {
        use AliceState::*;

        let transition = match (state, input) {
            (StartA, SwapInput::Start) => (CommitA, self.start_actions()),

            (
                CommitA,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::MakerCommit(commit),
                },
            ) if self.params.trade_role == TradeRole::Taker => (
                RevealA,
                vec![
                    Action::ForwardRemoteCommit { commit },
                    Action::ExchangeReveal,
                ],
            ),
            (
                CommitA,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::RevealProof(proof),
                },
            ) if self.params.trade_role == TradeRole::Maker => (
                RevealA,
                vec![
                    Action::ForwardRemoteProof { proof },
                    Action::ExchangeReveal,
                ],
            ),
            (
                CommitA,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::Reveal(reveal),
                },
            ) if self.params.trade_role == TradeRole::Maker => (
                RevealA,
                vec![
                    Action::ForwardRemoteReveal { reveal },
                    Action::ExchangeReveal,
                ],
            ),

            (
                RevealA,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::RevealProof(proof),
                },
            ) => (RevealA, vec![Action::ForwardRemoteProof { proof }]),
            (
                RevealA,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::Reveal(reveal),
                },
            ) => (RevealA, vec![Action::ForwardRemoteReveal { reveal }]),

            (
                RevealA,
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::CoreArbitratingSetup(setup),
                },
            ) => (RevealA, vec![Action::RequestRefundSignatures { setup }]),

            // Our signatures over Bob's cancel and refund: first milestone.
            (
                RevealA,
                SwapInput::Msg {
                    source: MsgSource::Wallet,
                    msg: ProtocolMsg::RefundProcedureSignatures(signatures),
                },
            ) => (
                RefundSigA {
                    lock_final: false,
                    buy_received: false,
                },
                vec![
                    Action::WatchTx {
                        label: TxLabel::Lock,
                    },
                    Action::WatchTx {
                        label: TxLabel::Cancel,
                    },
                    Action::WatchTx {
                        label: TxLabel::Refund,
                    },
                    Action::Checkpoint {
                        tag: CheckpointTag::AlicePreLock,
                    },
                    Action::SendPeer {
                        msg: ProtocolMsg::RefundProcedureSignatures(signatures),
                    },
                ],
            ),

            (
                RefundSigA { .. },
                SwapInput::Chain(ChainInput::TxSeen {
                    label: TxLabel::Cancel,
                }),
            ) => (
                CancelA {
                    cancel_broadcast: true,
                    cancel_final: false,
                },
                vec![],
            ),
            (state @ RefundSigA { .. }, SwapInput::Chain(ChainInput::TxSeen { .. })) => {
                (state.clone(), vec![])
            }

            // Bob's lock is final: time to fund the accordant leg.
            (
                RefundSigA {
                    lock_final: false,
                    buy_received,
                },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Lock,
                    height,
                }),
            ) => (
                RefundSigA {
                    lock_final: true,
                    buy_received: *buy_received,
                },
                vec![
                    Action::RequestAccordantAddress,
                    Action::RequestFundingAddress {
                        leg: SwapLeg::Accordant,
                    },
                    self.cancel_timelock_watch(height),
                ],
            ),

            (state @ RefundSigA { .. }, SwapInput::Chain(ChainInput::AccordantLockFunded)) => {
                (state.clone(), vec![])
            }

            (
                RefundSigA {
                    buy_received: false,
                    lock_final,
                },
                SwapInput::Msg {
                    source: MsgSource::Peer,
                    msg: ProtocolMsg::BuyProcedureSignature(sig),
                },
            ) => (
                RefundSigA {
                    lock_final: *lock_final,
                    buy_received: true,
                },
                vec![
                    Action::WatchTx {
                        label: TxLabel::Buy,
                    },
                    Action::Checkpoint {
                        tag: CheckpointTag::AlicePreBuy,
                    },
                    Action::BroadcastBuy { sig },
                ],
            ),

            (
                RefundSigA { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Buy,
                    ..
                }),
            ) => (
                FinishA(Outcome::Buy),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Buy,
                    },
                ],
            ),

            (RefundSigA { .. }, SwapInput::Chain(ChainInput::CancelValid)) => (
                CancelA {
                    cancel_broadcast: true,
                    cancel_final: false,
                },
                vec![Action::BroadcastTx {
                    label: TxLabel::Cancel,
                }],
            ),
            (
                RefundSigA { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Cancel,
                    height,
                }),
            ) => (
                CancelA {
                    cancel_broadcast: true,
                    cancel_final: true,
                },
                vec![self.punish_timelock_watch(height)],
            ),

            // Cancel final: from here Alice observes the refund window. Bob
            // refunding ends the swap; the punish timelock expiring without
            // a refund arms the punish path.
            (
                CancelA {
                    cancel_broadcast,
                    cancel_final: false,
                },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Cancel,
                    height,
                }),
            ) => (
                CancelA {
                    cancel_broadcast: *cancel_broadcast,
                    cancel_final: true,
                },
                vec![self.punish_timelock_watch(height)],
            ),
            (
                CancelA { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Refund,
                    ..
                }),
            ) => (
                FinishA(Outcome::Refund),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Refund,
                    },
                ],
            ),
            (
                CancelA { .. },
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Buy,
                    ..
                }),
            ) => (
                FinishA(Outcome::Buy),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Buy,
                    },
                ],
            ),
            (CancelA { .. }, SwapInput::Chain(ChainInput::PunishValid)) => (
                PunishA,
                vec![
                    Action::BroadcastTx {
                        label: TxLabel::Punish,
                    },
                    Action::WatchTx {
                        label: TxLabel::Punish,
                    },
                ],
            ),
            (state @ CancelA { .. }, SwapInput::Chain(ChainInput::TxSeen { .. })) => {
                (state.clone(), vec![])
            }

            (
                PunishA,
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Punish,
                    ..
                }),
            ) => (
                FinishA(Outcome::Punish),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Punish,
                    },
                ],
            ),
            // Bob's refund confirmed before our punish: the chain decided.
            (
                PunishA,
                SwapInput::Chain(ChainInput::TxFinal {
                    label: TxLabel::Refund,
                    ..
                }),
            ) => (
                FinishA(Outcome::Refund),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Refund,
                    },
                ],
            ),
            (PunishA, SwapInput::Chain(ChainInput::TxSeen { .. })) => (PunishA, vec![]),

            (StartA | CommitA | RevealA, SwapInput::Abort) => (
                FinishA(Outcome::Abort),
                vec![
                    Action::AbortWatches,
                    Action::Terminated {
                        outcome: Outcome::Abort,
                    },
                ],
            ),

            (_, input) => return Err(self.unexpected(&input)),
        };

        let (next, actions) = transition;
        Ok((SwapState::Alice(next), actions))
    }
}
