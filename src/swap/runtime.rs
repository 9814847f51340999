//! Per-swap runtime task
//!
//! One runtime owns one swap end to end: it serializes every input through
//! a single mailbox, feeds the state machine, and executes the returned
//! effects against walletd, syncerd, peerd and the checkpoint store. Failed
//! effects are parked and replayed in order before any new input is applied,
//! so a flaky collaborator delays a swap but never reorders it.

use crate::checkpoint::{
    CheckpointOwner, CheckpointSnapshot, CheckpointStore, CheckpointTag, SwapArtifacts,
};
use crate::config::SwapConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::{
    MsgSource, Outcome, PeerMessage, ProtocolMsg, SwapId, SwapLeg, SwapParams, SwapRole,
    TradeRole, TxId, TxLabel,
};
use crate::supervisor::SupervisorNotice;
use crate::swap::machine::{Action, ChainInput, SwapInput, SwapMachine};
use crate::swap::pending::{PendingBuffer, PendingKind};
use crate::swap::state::{AliceState, BobState, SwapState};
use crate::syncer::{
    SyncerEvent, SyncerTask, TaskEnvelope, TimelockKind, WatchSet, WatchSpec,
};
use crate::wallet::{WalletAuthority, WalletRequest, WalletResponse};

use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

/// Inputs routed to a swap runtime by the manager
#[derive(Debug)]
pub enum RuntimeMsg {
    Peer(ProtocolMsg),
    Syncer(SyncerEvent),
    Abort,
    PeerUnreachable,
    PeerReconnected,
}

/// Shared handles a runtime needs to reach its collaborators
#[derive(Clone)]
pub struct SwapServices {
    pub wallet: Arc<dyn WalletAuthority>,
    pub store: Arc<CheckpointStore>,
    pub syncer_tx: mpsc::Sender<TaskEnvelope>,
    pub peer_tx: mpsc::Sender<PeerMessage>,
    pub notice_tx: mpsc::Sender<SupervisorNotice>,
    pub done_tx: mpsc::Sender<SwapId>,
    pub config: SwapConfig,
}

enum Boot {
    Fresh,
    Restored {
        reregister: Vec<SyncerTask>,
        resume: Vec<Action>,
    },
}

/// The task driving one swap
pub struct SwapRuntime {
    swap_id: SwapId,
    machine: SwapMachine,
    artifacts: SwapArtifacts,
    watches: WatchSet,
    pending: PendingBuffer,
    services: SwapServices,
    mailbox: mpsc::Receiver<RuntimeMsg>,
    boot: Boot,

    /// Inputs waiting for the machine, in arrival order
    inbox: VecDeque<SwapInput>,
    /// Effects that failed against a collaborator, replayed before new input
    parked: VecDeque<Action>,
    /// Funding sighting the wallet has not acknowledged yet
    parked_funding: Option<(SwapLeg, TxId)>,
    parked_since: Option<Instant>,

    /// Legs whose funding address received final funds
    funded_legs: BTreeSet<SwapLeg>,
    /// Labels whose broadcast has been handed to syncerd this run
    broadcasts: BTreeSet<TxLabel>,
    /// Labels sighted on-chain, mempool or better
    seen: BTreeSet<TxLabel>,
    /// Labels a restored swap must re-broadcast unless a sighting arrives
    /// before the next height event
    deferred_broadcasts: BTreeSet<TxLabel>,

    peer_online: bool,
    peer_outbox: VecDeque<ProtocolMsg>,
    last_sent: Option<ProtocolMsg>,

    stall_notified: bool,
    halted: bool,
    outcome: Option<Outcome>,
}

impl SwapRuntime {
    /// Runtime for a freshly initialized swap
    pub fn new(
        params: SwapParams,
        mailbox: mpsc::Receiver<RuntimeMsg>,
        services: SwapServices,
    ) -> Self {
        let swap_id = params.swap_id;
        Self {
            swap_id,
            machine: SwapMachine::new(params),
            artifacts: SwapArtifacts::default(),
            watches: WatchSet::new(),
            pending: PendingBuffer::new(),
            services,
            mailbox,
            boot: Boot::Fresh,
            inbox: VecDeque::new(),
            parked: VecDeque::new(),
            parked_funding: None,
            parked_since: None,
            funded_legs: BTreeSet::new(),
            broadcasts: BTreeSet::new(),
            seen: BTreeSet::new(),
            deferred_broadcasts: BTreeSet::new(),
            peer_online: true,
            peer_outbox: VecDeque::new(),
            last_sent: None,
            stall_notified: false,
            halted: false,
            outcome: None,
        }
    }

    /// Runtime resuming from a checkpoint snapshot
    pub fn restored(
        snapshot: CheckpointSnapshot,
        mailbox: mpsc::Receiver<RuntimeMsg>,
        services: SwapServices,
    ) -> Self {
        let CheckpointSnapshot {
            swap_id,
            params,
            state,
            artifacts,
            pending,
            watches,
            broadcasts,
            funded_legs,
            ..
        } = snapshot;

        let (watch_set, reregister) = WatchSet::restore(watches);
        let (resume, deferred_broadcasts) = Self::resume_plan(&state, &artifacts, &broadcasts);
        let machine = SwapMachine::restore(params, state);

        Self {
            swap_id,
            machine,
            artifacts,
            watches: watch_set,
            pending: PendingBuffer::restore(pending),
            services,
            mailbox,
            boot: Boot::Restored { reregister, resume },
            inbox: VecDeque::new(),
            parked: VecDeque::new(),
            parked_funding: None,
            parked_since: None,
            funded_legs: funded_legs.into_iter().collect(),
            broadcasts: broadcasts.into_iter().collect(),
            seen: BTreeSet::new(),
            deferred_broadcasts,
            peer_online: true,
            peer_outbox: VecDeque::new(),
            last_sent: None,
            stall_notified: false,
            halted: false,
            outcome: None,
        }
    }

    /// Post-checkpoint effects implied by a restored state. Peer sends and
    /// wallet requests are replayed outright (artifacts may be re-derived
    /// with fresh signatures). Broadcasts are deferred: they run only if the
    /// re-registered watch reports no sighting by the next height event, so
    /// a transaction already in the mempool or confirmed is never re-sent.
    fn resume_plan(
        state: &SwapState,
        artifacts: &SwapArtifacts,
        broadcasts: &[TxLabel],
    ) -> (Vec<Action>, BTreeSet<TxLabel>) {
        let mut resume = Vec::new();
        let mut deferred = BTreeSet::new();

        match state {
            SwapState::Bob(BobState::CorearbB) => {
                if let Some(setup) = &artifacts.core_arbitrating_setup {
                    resume.push(Action::SendPeer {
                        msg: ProtocolMsg::CoreArbitratingSetup(setup.clone()),
                    });
                }
                if let Some(signatures) = &artifacts.refund_procedure_signatures {
                    resume.push(Action::RequestBuySignature {
                        signatures: signatures.clone(),
                    });
                }
            }
            SwapState::Bob(BobState::BuySigB { .. }) => {
                if !broadcasts.contains(&TxLabel::Lock) {
                    deferred.insert(TxLabel::Lock);
                }
            }
            SwapState::Alice(AliceState::RefundSigA {
                buy_received: false,
                ..
            }) => {
                if let Some(signatures) = &artifacts.refund_procedure_signatures {
                    resume.push(Action::SendPeer {
                        msg: ProtocolMsg::RefundProcedureSignatures(signatures.clone()),
                    });
                }
            }
            SwapState::Alice(AliceState::RefundSigA {
                buy_received: true, ..
            }) => {
                if !broadcasts.contains(&TxLabel::Buy) {
                    deferred.insert(TxLabel::Buy);
                }
            }
            other => {
                warn!("Restored swap in unexpected state {}", other);
            }
        }

        (resume, deferred)
    }

    /// Main loop. Returns the swap id when the runtime is done.
    pub async fn run(mut self) -> SwapId {
        let role = self.machine.params().role;
        let mut tick = interval(Duration::from_secs(
            self.services.config.stall_after_secs.max(1),
        ));
        tick.tick().await; // first tick fires immediately

        match std::mem::replace(&mut self.boot, Boot::Fresh) {
            Boot::Fresh => {
                info!("Swap {} starting as {}", self.swap_id, role);
                crate::metrics::record_swap_started(role);
                if let Err(e) = self.drive(SwapInput::Start).await {
                    self.halt(e).await;
                }
            }
            Boot::Restored { reregister, resume } => {
                info!(
                    "Swap {} restored at state {} with {} watch(es)",
                    self.swap_id,
                    self.machine.state(),
                    reregister.len()
                );
                crate::metrics::record_checkpoint_restored();
                if let Err(e) = self.resume(reregister, resume).await {
                    self.halt(e).await;
                }
            }
        }

        while self.outcome.is_none() && !self.halted {
            tokio::select! {
                maybe = self.mailbox.recv() => {
                    match maybe {
                        Some(msg) => {
                            if let Err(e) = self.handle(msg).await {
                                self.halt(e).await;
                                break;
                            }
                        }
                        None => {
                            info!("Swap {} mailbox closed, shutting down", self.swap_id);
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick().await {
                        self.halt(e).await;
                        break;
                    }
                }
            }
        }

        if let Some(outcome) = self.outcome {
            info!("Swap {} finished: {}", self.swap_id, outcome);
        }
        if self.services.done_tx.send(self.swap_id).await.is_err() {
            debug!("Swap {} manager already gone", self.swap_id);
        }
        self.swap_id
    }

    /// Structural failure: surface the swap and stop without touching its
    /// checkpoints, leaving the evidence in place.
    async fn halt(&mut self, e: CoordinatorError) {
        error!("Swap {} halted: {}", self.swap_id, e);
        crate::metrics::record_swap_halted();
        self.notify(SupervisorNotice::SwapStalled {
            swap_id: self.swap_id,
            reason: format!("halted: {}", e),
        })
        .await;
        self.halted = true;
    }

    async fn resume(
        &mut self,
        reregister: Vec<SyncerTask>,
        resume: Vec<Action>,
    ) -> CoordinatorResult<()> {
        for task in reregister {
            self.send_syncer(task).await?;
        }
        // Replays ride the parking queue so a collaborator failure mid-way
        // resumes cleanly on the next tick.
        self.parked.extend(resume);
        self.pump().await
    }

    async fn handle(&mut self, msg: RuntimeMsg) -> CoordinatorResult<()> {
        match msg {
            RuntimeMsg::Peer(msg) => self.handle_peer_msg(msg).await,
            RuntimeMsg::Syncer(event) => self.handle_syncer_event(event).await,
            RuntimeMsg::Abort => self.drive(SwapInput::Abort).await,
            RuntimeMsg::PeerUnreachable => {
                warn!("Swap {} peer unreachable", self.swap_id);
                self.peer_online = false;
                Ok(())
            }
            RuntimeMsg::PeerReconnected => {
                info!("Swap {} peer reconnected", self.swap_id);
                self.peer_online = true;
                self.on_peer_reconnect().await
            }
        }
    }

    async fn handle_peer_msg(&mut self, msg: ProtocolMsg) -> CoordinatorResult<()> {
        crate::metrics::record_peer_message(msg.kind());

        // Counterparty artifacts are captured as they arrive; the machine
        // routes on the message, the runtime owns the bytes.
        match &msg {
            ProtocolMsg::CoreArbitratingSetup(setup) => {
                self.artifacts.core_arbitrating_setup = Some(setup.clone());
            }
            ProtocolMsg::RefundProcedureSignatures(signatures) => {
                self.artifacts.refund_procedure_signatures = Some(signatures.clone());
            }
            ProtocolMsg::BuyProcedureSignature(sig) => {
                self.artifacts.buy_procedure_signature = Some(sig.clone());
            }
            _ => {}
        }

        if let Some(kind) = PendingKind::of(&msg) {
            if !self.reveal_gate_open() {
                if self.pending.hold(kind, msg).is_some() {
                    debug!(
                        "Swap {} retransmitted {} replaced the held copy",
                        self.swap_id,
                        kind.name()
                    );
                } else {
                    info!(
                        "Swap {} buffered early {} until funding completes",
                        self.swap_id,
                        kind.name()
                    );
                    crate::metrics::record_pending_buffered();
                }
                return Ok(());
            }
        }

        self.drive(SwapInput::Msg {
            source: MsgSource::Peer,
            msg,
        })
        .await
    }

    /// Bob cannot act on reveals before his arbitrating funding is in;
    /// Alice has no such gate.
    fn reveal_gate_open(&self) -> bool {
        match self.machine.params().role {
            SwapRole::Bob => self.funded_legs.contains(&SwapLeg::Arbitrating),
            SwapRole::Alice => true,
        }
    }

    async fn handle_syncer_event(&mut self, event: SyncerEvent) -> CoordinatorResult<()> {
        crate::metrics::record_syncer_event(event.kind());

        match event {
            SyncerEvent::HeightChanged { height } => {
                debug!("Swap {} sees height {}", self.swap_id, height);
                if !self.deferred_broadcasts.is_empty() {
                    self.flush_deferred().await?;
                }
                Ok(())
            }
            SyncerEvent::TransactionSeen { label, txid, .. } => {
                debug!("Swap {} {} seen in mempool ({})", self.swap_id, label, txid);
                self.seen.insert(label);
                self.deferred_broadcasts.remove(&label);
                self.drive(SwapInput::Chain(ChainInput::TxSeen { label })).await
            }
            SyncerEvent::TransactionConfirmations {
                label,
                confirmations,
                ..
            } => {
                debug!(
                    "Swap {} {} at {} confirmation(s)",
                    self.swap_id, label, confirmations
                );
                Ok(())
            }
            SyncerEvent::TransactionFinal {
                label,
                txid,
                height,
                ..
            } => {
                self.seen.insert(label);
                self.deferred_broadcasts.remove(&label);
                if !self.watches.note_tx_final(label) {
                    debug!(
                        "Swap {} duplicate final for {} dropped",
                        self.swap_id, label
                    );
                    return Ok(());
                }
                info!(
                    "Swap {} {} final at height {} ({})",
                    self.swap_id, label, height, txid
                );
                self.drive(SwapInput::Chain(ChainInput::TxFinal { label, height }))
                    .await
            }
            SyncerEvent::AddressFunded {
                label,
                leg,
                txid,
                amount,
                ..
            } => {
                if !self.watches.note_address_funded(label) {
                    debug!(
                        "Swap {} duplicate funding event for {} dropped",
                        self.swap_id, label
                    );
                    return Ok(());
                }
                self.handle_address_funded(label, leg, txid, amount).await
            }
            SyncerEvent::CancelValid { height } => {
                if !self.watches.note_timelock(TimelockKind::Cancel) {
                    debug!("Swap {} duplicate cancel-valid dropped", self.swap_id);
                    return Ok(());
                }
                warn!(
                    "Swap {} cancel timelock expired at height {}",
                    self.swap_id, height
                );
                self.drive(SwapInput::Chain(ChainInput::CancelValid)).await
            }
            SyncerEvent::PunishValid { height } => {
                if !self.watches.note_timelock(TimelockKind::Punish) {
                    debug!("Swap {} duplicate punish-valid dropped", self.swap_id);
                    return Ok(());
                }
                warn!(
                    "Swap {} punish timelock expired at height {}",
                    self.swap_id, height
                );
                self.drive(SwapInput::Chain(ChainInput::PunishValid)).await
            }
            SyncerEvent::FeeEstimate { sat_per_vbyte } => {
                debug!(
                    "Swap {} fee estimate: {} sat/vbyte",
                    self.swap_id, sat_per_vbyte
                );
                self.artifacts.fee_estimate = Some(sat_per_vbyte);
                Ok(())
            }
            SyncerEvent::TaskAborted { id } => {
                debug!("Swap {} syncer task {} deregistered", self.swap_id, id);
                Ok(())
            }
        }
    }

    async fn handle_address_funded(
        &mut self,
        label: TxLabel,
        leg: SwapLeg,
        txid: TxId,
        amount: u64,
    ) -> CoordinatorResult<()> {
        info!(
            "Swap {} {} address funded with {} on {} leg",
            self.swap_id, label, amount, leg
        );

        match label {
            TxLabel::Funding => {
                self.funded_legs.insert(leg);
                self.notify(SupervisorNotice::FundingCompleted {
                    swap_id: self.swap_id,
                    leg,
                })
                .await;
                self.sync_funding(leg, txid).await
            }
            TxLabel::AccordantLock => {
                self.drive(SwapInput::Chain(ChainInput::AccordantLockFunded))
                    .await
            }
            other => {
                warn!(
                    "Swap {} funding event for unexpected label {}",
                    self.swap_id, other
                );
                Ok(())
            }
        }
    }

    /// Hand a funding sighting to walletd so templates bind to the real
    /// outpoint, then release whatever was gated on it. Parked and replayed
    /// on the tick if walletd is unreachable.
    async fn sync_funding(&mut self, leg: SwapLeg, txid: TxId) -> CoordinatorResult<()> {
        match self
            .wallet_call(WalletRequest::FundingUpdated { leg, txid })
            .await
        {
            Ok(_) => {
                self.parked_funding = None;
                self.clear_parked();
                if leg == SwapLeg::Arbitrating {
                    self.flush_pending().await?;
                }
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    "Swap {} wallet funding update failed, will retry: {}",
                    self.swap_id, e
                );
                self.parked_funding = Some((leg, txid));
                self.note_parked();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Deliver buffered peer messages in protocol order. Flushing with
    /// nothing held is a legal no-op.
    async fn flush_pending(&mut self) -> CoordinatorResult<()> {
        let held = self.pending.flush();
        if held.is_empty() {
            debug!("Swap {} nothing pending to flush", self.swap_id);
            return Ok(());
        }
        info!(
            "Swap {} flushing {} buffered message(s)",
            self.swap_id,
            held.len()
        );
        crate::metrics::record_pending_flushed(held.len() as u64);
        for msg in held {
            self.inbox.push_back(SwapInput::Msg {
                source: MsgSource::Peer,
                msg,
            });
        }
        self.pump().await
    }

    /// Re-broadcast deferred labels that produced no sighting by now. Runs
    /// on height events only, never on a local clock.
    async fn flush_deferred(&mut self) -> CoordinatorResult<()> {
        let labels: Vec<TxLabel> = self.deferred_broadcasts.iter().copied().collect();
        for label in labels {
            info!(
                "Swap {} no sighting of {} since restore, broadcasting",
                self.swap_id, label
            );
            match self.broadcast_label(label).await {
                Ok(()) => {
                    self.deferred_broadcasts.remove(&label);
                }
                Err(e) if e.is_retryable() => {
                    // Stays deferred; the next height event retries.
                    warn!(
                        "Swap {} deferred broadcast of {} failed: {}",
                        self.swap_id, label, e
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn on_peer_reconnect(&mut self) -> CoordinatorResult<()> {
        if self.peer_outbox.is_empty() {
            // Nudge the counterparty by repeating our last message; a
            // duplicate is dropped on their side as an unexpected event.
            if let Some(msg) = self.last_sent.clone() {
                if self.outcome.is_none() && !self.machine.state().is_terminal() {
                    debug!(
                        "Swap {} re-sending {} after reconnect",
                        self.swap_id,
                        msg.kind()
                    );
                    self.send_peer(msg).await?;
                }
            }
            return Ok(());
        }
        while let Some(msg) = self.peer_outbox.pop_front() {
            self.send_peer(msg).await?;
        }
        Ok(())
    }

    async fn on_tick(&mut self) -> CoordinatorResult<()> {
        if self.machine.state().is_terminal() {
            return Ok(());
        }
        if let Some((leg, txid)) = self.parked_funding {
            self.sync_funding(leg, txid).await?;
        }
        if !self.parked.is_empty() || !self.inbox.is_empty() {
            self.pump().await?;
        }

        // Stalling means parked work a collaborator keeps refusing, not an
        // idle wait for chain confirmations.
        if let Some(since) = self.parked_since {
            let quiet = since.elapsed().as_secs();
            if quiet >= self.services.config.stall_after_secs && !self.stall_notified {
                warn!(
                    "Swap {} stalled: effects parked for {}s",
                    self.swap_id, quiet
                );
                self.stall_notified = true;
                crate::metrics::record_swap_stalled();
                self.notify(SupervisorNotice::SwapStalled {
                    swap_id: self.swap_id,
                    reason: format!("collaborator unavailable for {}s", quiet),
                })
                .await;
            }
        }
        Ok(())
    }

    fn note_parked(&mut self) {
        if self.parked_since.is_none() {
            self.parked_since = Some(Instant::now());
        }
    }

    fn clear_parked(&mut self) {
        if self.parked.is_empty() && self.parked_funding.is_none() {
            if self.stall_notified {
                info!("Swap {} recovered from stall", self.swap_id);
            }
            self.parked_since = None;
            self.stall_notified = false;
        }
    }

    async fn drive(&mut self, input: SwapInput) -> CoordinatorResult<()> {
        self.inbox.push_back(input);
        self.pump().await
    }

    /// Apply queued inputs and execute their effects, strictly in order.
    /// Parked effects replay first; while any remain, no new input touches
    /// the machine.
    async fn pump(&mut self) -> CoordinatorResult<()> {
        while let Some(action) = self.parked.front().cloned() {
            match self.execute(action).await {
                Ok(()) => {
                    self.parked.pop_front();
                }
                Err(e) if e.is_retryable() => {
                    debug!("Swap {} parked effect still failing: {}", self.swap_id, e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        self.clear_parked();

        while let Some(input) = self.inbox.pop_front() {
            if self.machine.state().is_terminal() {
                debug!(
                    "Swap {} finished, dropping {}",
                    self.swap_id,
                    input.describe()
                );
                continue;
            }

            let described = input.describe();
            let before = self.machine.state().to_string();
            match self.machine.apply(input) {
                Ok(actions) => {
                    let after = self.machine.state().to_string();
                    if after != before {
                        info!(
                            "Swap {} state {} -> {} on {}",
                            self.swap_id, before, after, described
                        );
                        crate::metrics::record_state_transition();
                    }

                    let mut queue: VecDeque<Action> = actions.into();
                    while let Some(action) = queue.pop_front() {
                        match self.execute(action.clone()).await {
                            Ok(()) => {}
                            Err(e) if e.is_retryable() => {
                                warn!(
                                    "Swap {} effect {} failed, parking: {}",
                                    self.swap_id,
                                    action.kind(),
                                    e
                                );
                                self.parked.push_back(action);
                                self.parked.append(&mut queue);
                                self.note_parked();
                                return Ok(());
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(state_err) => {
                    warn!("Swap {} dropped input: {}", self.swap_id, state_err);
                    crate::metrics::record_unexpected_event();
                }
            }
        }
        Ok(())
    }

    async fn execute(&mut self, action: Action) -> CoordinatorResult<()> {
        debug!("Swap {} executing {}", self.swap_id, action.kind());
        match action {
            Action::ExchangeCommit => {
                let commit = match self.wallet_call(WalletRequest::Commit).await? {
                    WalletResponse::Commit(commit) => commit,
                    other => return Err(self.unexpected_reply("commit", &other)),
                };
                let msg = match self.machine.params().trade_role {
                    TradeRole::Taker => ProtocolMsg::TakerCommit(commit),
                    TradeRole::Maker => ProtocolMsg::MakerCommit(commit),
                };
                self.send_peer(msg).await
            }
            Action::ForwardRemoteCommit { commit } => self
                .forward_to_wallet(WalletRequest::RemoteCommit { commit })
                .await,
            Action::ExchangeReveal => {
                let (proof, reveal) = match self.wallet_call(WalletRequest::Reveal).await? {
                    WalletResponse::Reveal { proof, reveal } => (proof, reveal),
                    other => return Err(self.unexpected_reply("reveal", &other)),
                };
                self.send_peer(ProtocolMsg::RevealProof(proof)).await?;
                self.send_peer(ProtocolMsg::Reveal(reveal)).await
            }
            Action::ForwardRemoteProof { proof } => self
                .forward_to_wallet(WalletRequest::RemoteRevealProof { proof })
                .await,
            Action::ForwardRemoteReveal { reveal } => self
                .forward_to_wallet(WalletRequest::RemoteReveal { reveal })
                .await,
            Action::RequestCoreArbitratingSetup => {
                let setup = match self
                    .wallet_call(WalletRequest::CoreArbitratingSetup)
                    .await?
                {
                    WalletResponse::CoreArbitratingSetup(setup) => setup,
                    other => {
                        return Err(self.unexpected_reply("core arbitrating setup", &other))
                    }
                };
                self.artifacts.core_arbitrating_setup = Some(setup.clone());
                self.inbox.push_back(SwapInput::Msg {
                    source: MsgSource::Wallet,
                    msg: ProtocolMsg::CoreArbitratingSetup(setup),
                });
                Ok(())
            }
            Action::RequestRefundSignatures { setup } => {
                let signatures = match self
                    .wallet_call(WalletRequest::RefundProcedureSignatures { setup })
                    .await?
                {
                    WalletResponse::RefundProcedureSignatures(signatures) => signatures,
                    other => {
                        return Err(self.unexpected_reply("refund procedure signatures", &other))
                    }
                };
                self.artifacts.refund_procedure_signatures = Some(signatures.clone());
                self.inbox.push_back(SwapInput::Msg {
                    source: MsgSource::Wallet,
                    msg: ProtocolMsg::RefundProcedureSignatures(signatures),
                });
                Ok(())
            }
            Action::RequestBuySignature { signatures } => {
                let sig = match self
                    .wallet_call(WalletRequest::BuyProcedureSignature { signatures })
                    .await?
                {
                    WalletResponse::BuyProcedureSignature(sig) => sig,
                    other => return Err(self.unexpected_reply("buy procedure signature", &other)),
                };
                self.artifacts.buy_procedure_signature = Some(sig.clone());
                self.inbox.push_back(SwapInput::Msg {
                    source: MsgSource::Wallet,
                    msg: ProtocolMsg::BuyProcedureSignature(sig),
                });
                Ok(())
            }
            Action::RequestFundingAddress { leg } => {
                let address = match self
                    .wallet_call(WalletRequest::FundingAddress { leg })
                    .await?
                {
                    WalletResponse::Address { address, .. } => address,
                    other => return Err(self.unexpected_reply("funding address", &other)),
                };
                self.artifacts.funding_address = Some(address.clone());
                let amount = match leg {
                    SwapLeg::Arbitrating => self.machine.params().arbitrating_amount,
                    SwapLeg::Accordant => self.machine.params().accordant_amount,
                };
                info!(
                    "Swap {} needs {} funded with {} at {}",
                    self.swap_id, leg, amount, address
                );
                self.notify(SupervisorNotice::FundingRequired {
                    swap_id: self.swap_id,
                    leg,
                    address: address.clone(),
                    amount,
                })
                .await;
                self.register_watch(WatchSpec::Address {
                    label: TxLabel::Funding,
                    leg,
                    address,
                    finality: self.finality_for(leg),
                })
                .await
            }
            Action::RequestAccordantAddress => {
                let address = match self
                    .wallet_call(WalletRequest::AccordantLockAddress)
                    .await?
                {
                    WalletResponse::Address { address, .. } => address,
                    other => return Err(self.unexpected_reply("accordant address", &other)),
                };
                self.artifacts.accordant_address = Some(address.clone());
                self.register_watch(WatchSpec::Address {
                    label: TxLabel::AccordantLock,
                    leg: SwapLeg::Accordant,
                    address,
                    finality: self.machine.params().accordant_finality,
                })
                .await
            }
            Action::SendPeer { msg } => self.send_peer(msg).await,
            Action::ReleaseBuySig => {
                let sig = self.artifacts.buy_procedure_signature.clone().ok_or_else(|| {
                    CoordinatorError::Internal("buy signature missing at release".into())
                })?;
                info!("Swap {} releasing held buy signature", self.swap_id);
                self.send_peer(ProtocolMsg::BuyProcedureSignature(sig)).await
            }
            Action::Checkpoint { tag } => self.write_checkpoint(tag).await,
            Action::WatchHeight => self.register_watch(WatchSpec::Height).await,
            Action::WatchTx { label } => {
                let txid = self.resolve_txid(label)?;
                self.register_watch(WatchSpec::Transaction {
                    label,
                    txid,
                    finality: self.machine.params().arbitrating_finality,
                })
                .await
            }
            Action::WatchTimelock {
                kind,
                valid_from_height,
            } => {
                self.register_watch(WatchSpec::Timelock {
                    kind,
                    valid_from_height,
                })
                .await
            }
            Action::EstimateFee => {
                let id = self.watches.allocate_id();
                self.send_syncer(SyncerTask::EstimateFee { id }).await
            }
            Action::BroadcastTx { label } => self.broadcast_label(label).await,
            Action::BroadcastBuy { sig } => {
                self.artifacts.buy_procedure_signature = Some(sig);
                self.broadcast_label(TxLabel::Buy).await
            }
            Action::AbortWatches => {
                for task in self.watches.drain_abort_tasks() {
                    self.send_syncer(task).await?;
                }
                Ok(())
            }
            Action::Terminated { outcome } => {
                crate::metrics::record_swap_outcome(outcome.name());
                self.notify(SupervisorNotice::SwapTerminated {
                    swap_id: self.swap_id,
                    outcome,
                })
                .await;
                // Terminal swaps keep no checkpoints around; a future
                // restore request must come up empty.
                if let Err(e) = self.services.store.remove(self.swap_id).await {
                    warn!(
                        "Swap {} failed to remove checkpoints: {}",
                        self.swap_id, e
                    );
                }
                self.outcome = Some(outcome);
                Ok(())
            }
        }
    }

    /// Forward counterparty material to walletd, expecting a plain ack
    async fn forward_to_wallet(&mut self, request: WalletRequest) -> CoordinatorResult<()> {
        let kind = request.kind();
        match self.wallet_call(request).await? {
            WalletResponse::Ack => Ok(()),
            other => {
                warn!(
                    "Swap {} wallet replied {} to forwarded {}",
                    self.swap_id,
                    other.kind(),
                    kind
                );
                Ok(())
            }
        }
    }

    /// Single wallet round-trip with timeout, bounded retries and delay,
    /// in that order per attempt.
    async fn wallet_call(&self, request: WalletRequest) -> CoordinatorResult<WalletResponse> {
        let kind = request.kind();
        let call_timeout = Duration::from_millis(self.services.config.wallet_timeout_ms);
        let max_attempts = self.services.config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            let call = self.services.wallet.request(self.swap_id, request.clone());
            match timeout(call_timeout, call).await {
                Ok(Ok(WalletResponse::Failure { reason })) => {
                    warn!(
                        "Swap {} wallet rejected {}: {} (attempt {}/{})",
                        self.swap_id, kind, reason, attempt, max_attempts
                    );
                    crate::metrics::record_wallet_failure(kind);
                    last_error = Some(CoordinatorError::Wallet(reason));
                }
                Ok(Ok(response)) => {
                    crate::metrics::observe_wallet_request(kind, started.elapsed().as_secs_f64());
                    return Ok(response);
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(
                        "Swap {} wallet {} failed: {} (attempt {}/{})",
                        self.swap_id, kind, e, attempt, max_attempts
                    );
                    last_error = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!(
                        "Swap {} wallet {} timed out (attempt {}/{})",
                        self.swap_id, kind, attempt, max_attempts
                    );
                    crate::metrics::record_wallet_failure(kind);
                    last_error = Some(CoordinatorError::Timeout {
                        operation: format!("wallet {}", kind),
                    });
                }
            }
            if attempt < max_attempts {
                sleep(Duration::from_millis(self.services.config.retry_delay_ms)).await;
            }
        }

        Err(last_error.unwrap_or_else(|| CoordinatorError::CollaboratorUnavailable {
            service: "walletd".to_string(),
            message: "request was never attempted".to_string(),
        }))
    }

    fn unexpected_reply(&self, request: &str, response: &WalletResponse) -> CoordinatorError {
        CoordinatorError::Internal(format!(
            "wallet replied {} to a {} request",
            response.kind(),
            request
        ))
    }

    async fn write_checkpoint(&self, tag: CheckpointTag) -> CoordinatorResult<()> {
        let snapshot = CheckpointSnapshot {
            swap_id: self.swap_id,
            params: self.machine.params().clone(),
            state: self.machine.state().clone(),
            artifacts: self.artifacts.clone(),
            pending: self.pending.snapshot(),
            watches: self.watches.outstanding(),
            broadcasts: self.broadcasts.iter().copied().collect(),
            funded_legs: self.funded_legs.iter().copied().collect(),
            created_at: Utc::now(),
        };
        self.services
            .store
            .record(CheckpointOwner::Swap, tag, &snapshot)
            .await?;
        info!("Swap {} checkpoint {} written", self.swap_id, tag);
        crate::metrics::record_checkpoint_written(tag.name());
        Ok(())
    }

    /// Finalize and broadcast a transaction by label, at most once per run
    async fn broadcast_label(&mut self, label: TxLabel) -> CoordinatorResult<()> {
        if self.broadcasts.contains(&label) {
            debug!(
                "Swap {} broadcast of {} already requested",
                self.swap_id, label
            );
            return Ok(());
        }

        let signed = match self.artifacts.signed.get(&label) {
            Some(tx) => tx.clone(),
            None => {
                let sat_per_vbyte = self
                    .artifacts
                    .fee_estimate
                    .unwrap_or(self.machine.params().sat_per_vbyte);
                let request = match (label, &self.artifacts.buy_procedure_signature) {
                    (TxLabel::Buy, Some(sig)) => WalletRequest::FullySignedBuy {
                        sig: sig.clone(),
                        sat_per_vbyte,
                    },
                    _ => WalletRequest::FullySignedTx {
                        label,
                        sat_per_vbyte,
                    },
                };
                match self.wallet_call(request).await? {
                    WalletResponse::FullySignedTx(tx) => {
                        self.artifacts.signed.insert(label, tx.clone());
                        tx
                    }
                    other => return Err(self.unexpected_reply("fully signed tx", &other)),
                }
            }
        };

        info!(
            "Swap {} broadcasting {} ({})",
            self.swap_id, label, signed.txid
        );
        let id = self.watches.allocate_id();
        self.send_syncer(SyncerTask::Broadcast { id, tx: signed }).await?;
        self.broadcasts.insert(label);
        crate::metrics::record_broadcast(label.name());
        Ok(())
    }

    /// Resolve the txid a label currently refers to from the accumulated
    /// artifacts
    fn resolve_txid(&self, label: TxLabel) -> CoordinatorResult<TxId> {
        let setup = self.artifacts.core_arbitrating_setup.as_ref();
        let txid = match label {
            TxLabel::Lock => setup.map(|s| s.lock.txid),
            TxLabel::Cancel => setup.map(|s| s.cancel.txid),
            TxLabel::Refund => setup.map(|s| s.refund.txid),
            TxLabel::Buy => self
                .artifacts
                .buy_procedure_signature
                .as_ref()
                .map(|sig| sig.buy.txid),
            TxLabel::Punish => self.artifacts.signed.get(&TxLabel::Punish).map(|tx| tx.txid),
            TxLabel::Funding | TxLabel::AccordantLock => None,
        };
        txid.ok_or_else(|| {
            CoordinatorError::Internal(format!("no transaction artifact for {}", label))
        })
    }

    fn finality_for(&self, leg: SwapLeg) -> u32 {
        match leg {
            SwapLeg::Arbitrating => self.machine.params().arbitrating_finality,
            SwapLeg::Accordant => self.machine.params().accordant_finality,
        }
    }

    async fn register_watch(&mut self, spec: WatchSpec) -> CoordinatorResult<()> {
        if let Some(task) = self.watches.register(spec) {
            self.send_syncer(task).await?;
            crate::metrics::record_watch_registered();
        }
        Ok(())
    }

    async fn send_syncer(&self, task: SyncerTask) -> CoordinatorResult<()> {
        debug!(
            "Swap {} sending {} task {} to syncerd",
            self.swap_id,
            task.kind(),
            task.id()
        );
        self.services
            .syncer_tx
            .send(TaskEnvelope {
                swap_id: self.swap_id,
                task,
            })
            .await
            .map_err(|_| CoordinatorError::Bus {
                service: "syncerd".to_string(),
                message: "task channel closed".to_string(),
            })
    }

    async fn send_peer(&mut self, msg: ProtocolMsg) -> CoordinatorResult<()> {
        if !self.peer_online {
            info!(
                "Swap {} peer offline, queueing {}",
                self.swap_id,
                msg.kind()
            );
            self.peer_outbox.push_back(msg);
            return Ok(());
        }
        let kind = msg.kind();
        self.services
            .peer_tx
            .send(PeerMessage {
                swap_id: self.swap_id,
                body: msg.clone(),
            })
            .await
            .map_err(|_| CoordinatorError::Bus {
                service: "peerd".to_string(),
                message: "peer channel closed".to_string(),
            })?;
        self.last_sent = Some(msg);
        debug!("Swap {} sent {} to peer", self.swap_id, kind);
        crate::metrics::record_peer_message_sent(kind);
        Ok(())
    }

    async fn notify(&self, notice: SupervisorNotice) {
        if self.services.notice_tx.send(notice).await.is_err() {
            warn!("Swap {} supervisor channel closed", self.swap_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        Address, BuyProcedureSignature, CommitParams, CoreArbitratingSetup, Network,
        RefundProcedureSignatures, SignedTx, TxTemplate,
    };
    use crate::wallet::MockWalletAuthority;

    fn params(role: SwapRole) -> SwapParams {
        SwapParams {
            swap_id: SwapId::random(),
            role,
            trade_role: TradeRole::Taker,
            network: Network::Local,
            arbitrating_amount: 250_000,
            accordant_amount: 9_000_000,
            arbitrating_finality: 3,
            accordant_finality: 10,
            cancel_timelock: 16,
            punish_timelock: 32,
            sat_per_vbyte: 2,
            remote_commit: None,
        }
    }

    fn swap_config() -> SwapConfig {
        SwapConfig {
            mailbox_depth: 16,
            wallet_timeout_ms: 200,
            max_retries: 1,
            retry_delay_ms: 1,
            stall_after_secs: 60,
        }
    }

    struct Harness {
        runtime: SwapRuntime,
        syncer_rx: mpsc::Receiver<TaskEnvelope>,
        peer_rx: mpsc::Receiver<PeerMessage>,
        notice_rx: mpsc::Receiver<SupervisorNotice>,
    }

    async fn harness(role: SwapRole, wallet: MockWalletAuthority) -> Harness {
        let store = CheckpointStore::new(&crate::config::DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
        })
        .await
        .unwrap();
        store.run_migrations().await.unwrap();

        let (syncer_tx, syncer_rx) = mpsc::channel(64);
        let (peer_tx, peer_rx) = mpsc::channel(64);
        let (notice_tx, notice_rx) = mpsc::channel(64);
        let (done_tx, _done_rx) = mpsc::channel(4);
        let (_mail_tx, mailbox) = mpsc::channel(16);

        let services = SwapServices {
            wallet: Arc::new(wallet),
            store: Arc::new(store),
            syncer_tx,
            peer_tx,
            notice_tx,
            done_tx,
            config: swap_config(),
        };

        Harness {
            runtime: SwapRuntime::new(params(role), mailbox, services),
            syncer_rx,
            peer_rx,
            notice_rx,
        }
    }

    fn setup() -> CoreArbitratingSetup {
        CoreArbitratingSetup {
            lock: TxTemplate {
                txid: TxId([1; 32]),
                raw: vec![1],
            },
            cancel: TxTemplate {
                txid: TxId([2; 32]),
                raw: vec![2],
            },
            refund: TxTemplate {
                txid: TxId([3; 32]),
                raw: vec![3],
            },
            cancel_sig: vec![4],
        }
    }

    #[tokio::test]
    async fn test_early_reveal_is_buffered_for_unfunded_bob() {
        let mut h = harness(SwapRole::Bob, MockWalletAuthority::new()).await;

        let msg = ProtocolMsg::Reveal(crate::protocol::RevealParams { reveal: vec![9] });
        h.runtime.handle_peer_msg(msg).await.unwrap();

        assert_eq!(h.runtime.pending.len(), 1);
        assert_eq!(h.runtime.machine.state().name(), "StartB");
    }

    #[tokio::test]
    async fn test_alice_has_no_reveal_gate() {
        let mut h = harness(SwapRole::Alice, MockWalletAuthority::new()).await;

        // Delivered straight to the machine, which drops it as unexpected
        // in StartA - but it is not buffered.
        let msg = ProtocolMsg::Reveal(crate::protocol::RevealParams { reveal: vec![9] });
        h.runtime.handle_peer_msg(msg).await.unwrap();
        assert!(h.runtime.pending.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_txid_from_setup_artifacts() {
        let mut h = harness(SwapRole::Bob, MockWalletAuthority::new()).await;
        h.runtime.artifacts.core_arbitrating_setup = Some(setup());

        assert_eq!(h.runtime.resolve_txid(TxLabel::Lock).unwrap(), TxId([1; 32]));
        assert_eq!(
            h.runtime.resolve_txid(TxLabel::Refund).unwrap(),
            TxId([3; 32])
        );
        assert!(h.runtime.resolve_txid(TxLabel::Buy).is_err());
    }

    #[tokio::test]
    async fn test_duplicate_final_does_not_reach_the_machine() {
        let mut h = harness(SwapRole::Bob, MockWalletAuthority::new()).await;
        h.runtime.watches.register(WatchSpec::Transaction {
            label: TxLabel::Lock,
            txid: TxId([1; 32]),
            finality: 3,
        });

        let event = SyncerEvent::TransactionFinal {
            id: crate::syncer::TaskId(1),
            label: TxLabel::Lock,
            txid: TxId([1; 32]),
            height: 100,
        };
        // First delivery reaches the machine (and is dropped as unexpected
        // in StartB); the repeat is swallowed before the machine sees it.
        h.runtime.handle_syncer_event(event.clone()).await.unwrap();
        h.runtime.handle_syncer_event(event).await.unwrap();
        assert!(!h.runtime.watches.note_tx_final(TxLabel::Lock));
    }

    #[tokio::test]
    async fn test_resume_plan_defers_lock_broadcast_at_buy_sig() {
        let state = SwapState::Bob(BobState::BuySigB {
            lock_final: false,
            buy_sig_released: false,
        });
        let mut artifacts = SwapArtifacts::default();
        artifacts.core_arbitrating_setup = Some(setup());

        let (resume, deferred) = SwapRuntime::resume_plan(&state, &artifacts, &[]);
        assert!(resume.is_empty());
        assert!(deferred.contains(&TxLabel::Lock));

        // A lock recorded as broadcast before the snapshot is not re-sent.
        let (_, deferred) =
            SwapRuntime::resume_plan(&state, &artifacts, &[TxLabel::Lock]);
        assert!(deferred.is_empty());
    }

    #[tokio::test]
    async fn test_resume_plan_resends_setup_at_corearb() {
        let state = SwapState::Bob(BobState::CorearbB);
        let mut artifacts = SwapArtifacts::default();
        artifacts.core_arbitrating_setup = Some(setup());
        artifacts.refund_procedure_signatures = Some(RefundProcedureSignatures {
            cancel_sig: vec![5],
            refund_adaptor_sig: vec![6],
        });

        let (resume, deferred) = SwapRuntime::resume_plan(&state, &artifacts, &[]);
        assert!(deferred.is_empty());
        assert_eq!(resume.len(), 2);
        assert!(matches!(resume[0], Action::SendPeer { .. }));
        assert!(matches!(resume[1], Action::RequestBuySignature { .. }));
    }

    #[tokio::test]
    async fn test_broadcast_label_is_idempotent_per_run() {
        let mut h = harness(SwapRole::Bob, MockWalletAuthority::new()).await;
        h.runtime.broadcasts.insert(TxLabel::Lock);

        // No wallet expectation is set: a second request would panic the
        // mock, so returning Ok proves the dedupe short-circuits.
        h.runtime.broadcast_label(TxLabel::Lock).await.unwrap();
        assert!(h.syncer_rx.try_recv().is_err());
    }

    fn commit() -> CommitParams {
        CommitParams {
            commitment: vec![0xc0],
        }
    }

    fn proof() -> crate::protocol::Proof {
        crate::protocol::Proof { proof: vec![0xc1] }
    }

    fn reveal() -> crate::protocol::RevealParams {
        crate::protocol::RevealParams { reveal: vec![0xc2] }
    }

    fn refund_sigs() -> RefundProcedureSignatures {
        RefundProcedureSignatures {
            cancel_sig: vec![0xc3],
            refund_adaptor_sig: vec![0xc4],
        }
    }

    fn buy_sig() -> BuyProcedureSignature {
        BuyProcedureSignature {
            buy: TxTemplate {
                txid: TxId([7; 32]),
                raw: vec![7],
            },
            buy_adaptor_sig: vec![0xc5],
        }
    }

    fn funded(label: TxLabel, leg: SwapLeg) -> SyncerEvent {
        SyncerEvent::AddressFunded {
            id: crate::syncer::TaskId(0),
            label,
            leg,
            txid: TxId([0xf0; 32]),
            amount: 250_000,
        }
    }

    fn tx_final(label: TxLabel, txid: TxId, height: u64) -> SyncerEvent {
        SyncerEvent::TransactionFinal {
            id: crate::syncer::TaskId(0),
            label,
            txid,
            height,
        }
    }

    /// A wallet that answers every request the Bob happy path makes.
    fn scripted_wallet() -> MockWalletAuthority {
        let mut wallet = MockWalletAuthority::new();
        wallet.expect_request().returning(|_, request| {
            Ok(match request {
                WalletRequest::Commit => WalletResponse::Commit(commit()),
                WalletRequest::Reveal => WalletResponse::Reveal {
                    proof: proof(),
                    reveal: reveal(),
                },
                WalletRequest::FundingAddress { leg } => WalletResponse::Address {
                    leg,
                    address: Address("bcrt1qfund".to_string()),
                },
                WalletRequest::AccordantLockAddress => WalletResponse::Address {
                    leg: SwapLeg::Accordant,
                    address: Address("55accordant".to_string()),
                },
                WalletRequest::CoreArbitratingSetup => {
                    WalletResponse::CoreArbitratingSetup(setup())
                }
                WalletRequest::BuyProcedureSignature { .. } => {
                    WalletResponse::BuyProcedureSignature(buy_sig())
                }
                WalletRequest::FullySignedTx { label, .. } => {
                    WalletResponse::FullySignedTx(SignedTx {
                        label,
                        txid: TxId([0xee; 32]),
                        raw: vec![0xee],
                    })
                }
                _ => WalletResponse::Ack,
            })
        });
        wallet
    }

    /// Drive a taker-Bob runtime from Start to the BobPreBuy checkpoint:
    /// commits exchanged, reveals buffered then flushed by funding, setup
    /// sent, refund signatures answered with the buy signature request.
    async fn drive_bob_to_pre_buy(h: &mut Harness) {
        h.runtime.drive(SwapInput::Start).await.unwrap();
        assert_eq!(h.runtime.machine.state().name(), "CommitB");

        h.runtime
            .handle_peer_msg(ProtocolMsg::MakerCommit(commit()))
            .await
            .unwrap();
        assert_eq!(h.runtime.machine.state().name(), "RevealB");

        // Reveals outrun the funding confirmation and wait in the buffer.
        h.runtime
            .handle_peer_msg(ProtocolMsg::RevealProof(proof()))
            .await
            .unwrap();
        h.runtime
            .handle_peer_msg(ProtocolMsg::Reveal(reveal()))
            .await
            .unwrap();
        assert_eq!(h.runtime.pending.len(), 2);

        // Funding opens the gate: the flush carries the swap to CorearbB.
        h.runtime
            .handle_syncer_event(funded(TxLabel::Funding, SwapLeg::Arbitrating))
            .await
            .unwrap();
        assert_eq!(h.runtime.machine.state().name(), "CorearbB");
        assert!(h.runtime.pending.is_empty());

        h.runtime
            .handle_peer_msg(ProtocolMsg::RefundProcedureSignatures(refund_sigs()))
            .await
            .unwrap();
        assert_eq!(h.runtime.machine.state().name(), "BuySigB");
        assert!(h.runtime.broadcasts.contains(&TxLabel::Lock));
    }

    #[tokio::test]
    async fn test_bob_taker_runs_the_full_happy_path() {
        let mut h = harness(SwapRole::Bob, scripted_wallet()).await;
        drive_bob_to_pre_buy(&mut h).await;

        // Lock finality starts the accordant phase.
        h.runtime
            .handle_syncer_event(tx_final(TxLabel::Lock, TxId([1; 32]), 120))
            .await
            .unwrap();
        // The joint lock is funded: the held buy signature is released.
        h.runtime
            .handle_syncer_event(funded(TxLabel::AccordantLock, SwapLeg::Accordant))
            .await
            .unwrap();
        // Buy finality ends the swap.
        h.runtime
            .handle_syncer_event(tx_final(TxLabel::Buy, TxId([7; 32]), 140))
            .await
            .unwrap();

        assert_eq!(h.runtime.machine.state().name(), "FinishB");
        assert_eq!(h.runtime.outcome, Some(Outcome::Buy));

        // Peer traffic in protocol order.
        let mut kinds = Vec::new();
        while let Ok(msg) = h.peer_rx.try_recv() {
            kinds.push(msg.body.kind());
        }
        assert_eq!(
            kinds,
            vec![
                "taker_commit",
                "reveal_proof",
                "reveal",
                "core_arbitrating_setup",
                "buy_procedure_signature",
            ]
        );

        // Lifecycle notices in order.
        let mut notices = Vec::new();
        while let Ok(notice) = h.notice_rx.try_recv() {
            notices.push(notice.kind());
        }
        assert_eq!(
            notices,
            vec!["funding_required", "funding_completed", "swap_terminated"]
        );

        // Termination removed the checkpoint row.
        let latest = h
            .runtime
            .services
            .store
            .latest(h.runtime.swap_id)
            .await
            .unwrap();
        assert!(latest.is_none());

        // Every outstanding watch was aborted: height, funding address,
        // lock, cancel, refund, buy, accordant address, cancel timelock.
        let mut aborts = 0;
        while let Ok(envelope) = h.syncer_rx.try_recv() {
            if matches!(envelope.task, SyncerTask::Abort { .. }) {
                aborts += 1;
            }
        }
        assert_eq!(aborts, 8);
    }

    /// Checkpoint, restart at BobPreBuy, and hand back the runtime with its
    /// snapshot watches already re-registered (and drained from the channel).
    async fn restored_at_pre_buy() -> (SwapRuntime, mpsc::Receiver<TaskEnvelope>) {
        let mut h = harness(SwapRole::Bob, scripted_wallet()).await;
        drive_bob_to_pre_buy(&mut h).await;

        let snapshot = h
            .runtime
            .services
            .store
            .latest(h.runtime.swap_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state.name(), "BuySigB");
        // The checkpoint precedes the lock broadcast in its batch, so the
        // snapshot must not claim the lock ever went out.
        assert!(snapshot.broadcasts.is_empty());

        let (syncer_tx, mut syncer_rx) = mpsc::channel(64);
        let (peer_tx, _peer_rx) = mpsc::channel(64);
        let (notice_tx, _notice_rx) = mpsc::channel(64);
        let (done_tx, _done_rx) = mpsc::channel(4);
        let (_mail_tx, mailbox) = mpsc::channel(16);
        let services = SwapServices {
            wallet: Arc::new(scripted_wallet()),
            store: h.runtime.services.store.clone(),
            syncer_tx,
            peer_tx,
            notice_tx,
            done_tx,
            config: swap_config(),
        };

        let mut restored = SwapRuntime::restored(snapshot, mailbox, services);
        assert_eq!(restored.machine.state().name(), "BuySigB");
        assert!(restored.deferred_broadcasts.contains(&TxLabel::Lock));

        match std::mem::replace(&mut restored.boot, Boot::Fresh) {
            Boot::Restored { reregister, resume } => {
                restored.resume(reregister, resume).await.unwrap();
            }
            Boot::Fresh => panic!("restored runtime must carry a restore plan"),
        }

        // Snapshot watches go straight back to the syncer, nothing else:
        // height, funding address, lock, cancel, refund, buy.
        let mut reregistered = 0;
        while let Ok(envelope) = syncer_rx.try_recv() {
            assert!(!matches!(envelope.task, SyncerTask::Broadcast { .. }));
            reregistered += 1;
        }
        assert_eq!(reregistered, 6);

        (restored, syncer_rx)
    }

    #[tokio::test]
    async fn test_restored_swap_rebroadcasts_lock_on_the_next_height() {
        let (mut restored, mut syncer_rx) = restored_at_pre_buy().await;

        // A height tick proves the old broadcast never landed: push it now.
        restored
            .handle_syncer_event(SyncerEvent::HeightChanged { height: 121 })
            .await
            .unwrap();

        let envelope = syncer_rx.try_recv().expect("lock broadcast after height");
        match envelope.task {
            SyncerTask::Broadcast { tx, .. } => assert_eq!(tx.label, TxLabel::Lock),
            other => panic!("expected a broadcast, got {:?}", other),
        }
        assert!(restored.deferred_broadcasts.is_empty());
        assert!(restored.broadcasts.contains(&TxLabel::Lock));
    }

    #[tokio::test]
    async fn test_seen_lock_cancels_the_deferred_rebroadcast() {
        let (mut restored, mut syncer_rx) = restored_at_pre_buy().await;

        // The chain already carries the lock: the deferral is dropped.
        restored
            .handle_syncer_event(SyncerEvent::TransactionSeen {
                id: crate::syncer::TaskId(2),
                label: TxLabel::Lock,
                txid: TxId([1; 32]),
            })
            .await
            .unwrap();
        assert!(restored.deferred_broadcasts.is_empty());

        restored
            .handle_syncer_event(SyncerEvent::HeightChanged { height: 121 })
            .await
            .unwrap();
        assert!(syncer_rx.try_recv().is_err());
        assert!(restored.broadcasts.is_empty());
    }

    #[tokio::test]
    async fn test_wallet_failure_parks_actions_in_order() {
        let mut wallet = MockWalletAuthority::new();
        wallet
            .expect_request()
            .returning(|_, _| {
                Err(CoordinatorError::CollaboratorUnavailable {
                    service: "walletd".to_string(),
                    message: "connection refused".to_string(),
                })
            });

        let mut h = harness(SwapRole::Bob, wallet).await;
        h.runtime.artifacts.buy_procedure_signature = Some(BuyProcedureSignature {
            buy: TxTemplate {
                txid: TxId([7; 32]),
                raw: vec![7],
            },
            buy_adaptor_sig: vec![8],
        });

        h.runtime
            .parked
            .push_back(Action::BroadcastTx { label: TxLabel::Buy });
        h.runtime.note_parked();
        h.runtime.pump().await.unwrap();

        // Still parked, nothing was broadcast.
        assert_eq!(h.runtime.parked.len(), 1);
        assert!(h.syncer_rx.try_recv().is_err());
    }
}
