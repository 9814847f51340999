//! Swap registry
//!
//! Owns the set of running swap tasks and routes control requests, peer
//! messages and chain events to the right mailbox. Each swap runs on its
//! own tokio task; the manager never blocks on a swap making progress.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::{PeerMessage, ProtocolMsg, SwapId, SwapParams};
use crate::supervisor::{CtlRequest, SupervisorNotice};
use crate::swap::runtime::{RuntimeMsg, SwapRuntime, SwapServices};
use crate::syncer::EventEnvelope;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

struct SwapHandle {
    msg_tx: mpsc::Sender<RuntimeMsg>,
    join: JoinHandle<SwapId>,
}

pub struct SwapManager {
    services: SwapServices,
    swaps: DashMap<SwapId, SwapHandle>,
}

impl SwapManager {
    pub fn new(services: SwapServices) -> Self {
        Self {
            services,
            swaps: DashMap::new(),
        }
    }

    /// Ids of the swaps currently running
    pub fn running(&self) -> Vec<SwapId> {
        self.swaps.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_running(&self, swap_id: SwapId) -> bool {
        self.swaps.contains_key(&swap_id)
    }

    /// Start a fresh swap from validated parameters
    pub fn init_swap(&self, params: SwapParams) -> CoordinatorResult<()> {
        params.validate().map_err(CoordinatorError::Config)?;
        let swap_id = params.swap_id;

        match self.swaps.entry(swap_id) {
            Entry::Occupied(_) => Err(CoordinatorError::SwapAlreadyRunning { swap_id }),
            Entry::Vacant(slot) => {
                let (msg_tx, mailbox) = mpsc::channel(self.services.config.mailbox_depth);
                let runtime = SwapRuntime::new(params, mailbox, self.services.clone());
                let join = tokio::spawn(runtime.run());
                slot.insert(SwapHandle { msg_tx, join });
                info!("Swap {} registered", swap_id);
                crate::metrics::set_swaps_running(self.swaps.len() as i64);
                Ok(())
            }
        }
    }

    /// Resume a swap from its latest checkpoint
    pub async fn restore_swap(&self, swap_id: SwapId) -> CoordinatorResult<()> {
        if self.is_running(swap_id) {
            return Err(CoordinatorError::SwapAlreadyRunning { swap_id });
        }
        let snapshot = self
            .services
            .store
            .latest(swap_id)
            .await?
            .ok_or(CoordinatorError::CheckpointNotFound { swap_id })?;

        // The table is shared with walletd; never trust a row blindly.
        if snapshot.state.role() != snapshot.params.role {
            return Err(CoordinatorError::InconsistentSnapshot {
                swap_id,
                reason: format!(
                    "state {} does not belong to role {}",
                    snapshot.state.name(),
                    snapshot.params.role
                ),
            });
        }

        // The store read awaited, so re-check under the entry.
        match self.swaps.entry(swap_id) {
            Entry::Occupied(_) => Err(CoordinatorError::SwapAlreadyRunning { swap_id }),
            Entry::Vacant(slot) => {
                let (msg_tx, mailbox) = mpsc::channel(self.services.config.mailbox_depth);
                let runtime = SwapRuntime::restored(snapshot, mailbox, self.services.clone());
                let join = tokio::spawn(runtime.run());
                slot.insert(SwapHandle { msg_tx, join });
                info!("Swap {} re-registered from checkpoint", swap_id);
                crate::metrics::set_swaps_running(self.swaps.len() as i64);
                Ok(())
            }
        }
    }

    pub async fn abort_swap(&self, swap_id: SwapId) -> CoordinatorResult<()> {
        self.route(swap_id, RuntimeMsg::Abort).await
    }

    pub async fn handle_ctl(&self, request: CtlRequest) -> CoordinatorResult<()> {
        debug!("Handling {} control request", request.kind());
        match request {
            CtlRequest::InitSwap(params) => self.init_swap(*params),
            CtlRequest::RestoreSwap { swap_id } => self.restore_swap(swap_id).await,
            CtlRequest::AbortSwap { swap_id } => self.abort_swap(swap_id).await,
            CtlRequest::PeerUnreachable { swap_id } => {
                self.route(swap_id, RuntimeMsg::PeerUnreachable).await
            }
            CtlRequest::PeerReconnected { swap_id } => {
                self.route(swap_id, RuntimeMsg::PeerReconnected).await
            }
            CtlRequest::ListSwaps => {
                let swaps = self.running();
                self.notify(SupervisorNotice::RunningSwaps { swaps }).await;
                Ok(())
            }
        }
    }

    /// Route a counterparty message to its swap. A taker commitment for a
    /// swap this daemon is not running is surfaced to supervisord instead
    /// of dropped; anything else unknown is dropped with a warning.
    pub async fn deliver_peer(&self, msg: PeerMessage) -> CoordinatorResult<()> {
        let PeerMessage { swap_id, body } = msg;

        if let Some(tx) = self.sender_for(swap_id) {
            let kind = body.kind();
            if tx.send(RuntimeMsg::Peer(body)).await.is_err() {
                debug!("Swap {} finished before {} arrived", swap_id, kind);
            }
            return Ok(());
        }

        match body {
            ProtocolMsg::TakerCommit(commit) => {
                info!("Taker commitment for unknown swap {}", swap_id);
                self.notify(SupervisorNotice::SwapProposed { swap_id, commit })
                    .await;
            }
            other => {
                warn!(
                    "Dropping {} for unknown swap {}",
                    other.kind(),
                    swap_id
                );
            }
        }
        Ok(())
    }

    /// Route a chain event to its swap. Stragglers for finished swaps are
    /// normal and dropped quietly.
    pub async fn deliver_syncer(&self, envelope: EventEnvelope) -> CoordinatorResult<()> {
        let EventEnvelope { swap_id, event } = envelope;

        match self.sender_for(swap_id) {
            Some(tx) => {
                let kind = event.kind();
                if tx.send(RuntimeMsg::Syncer(event)).await.is_err() {
                    debug!("Swap {} finished before {} arrived", swap_id, kind);
                }
            }
            None => {
                debug!(
                    "Dropping {} event for unknown swap {}",
                    event.kind(),
                    swap_id
                );
            }
        }
        Ok(())
    }

    async fn route(&self, swap_id: SwapId, msg: RuntimeMsg) -> CoordinatorResult<()> {
        let tx = self
            .sender_for(swap_id)
            .ok_or(CoordinatorError::SwapNotFound { swap_id })?;
        tx.send(msg)
            .await
            .map_err(|_| CoordinatorError::SwapNotFound { swap_id })
    }

    // Clone the sender out so no map ref is held across an await.
    fn sender_for(&self, swap_id: SwapId) -> Option<mpsc::Sender<RuntimeMsg>> {
        self.swaps.get(&swap_id).map(|handle| handle.msg_tx.clone())
    }

    async fn notify(&self, notice: SupervisorNotice) {
        if self.services.notice_tx.send(notice).await.is_err() {
            warn!("Supervisor channel closed");
        }
    }

    /// Deregister swaps as their tasks finish
    pub async fn run_reaper(self: Arc<Self>, mut done_rx: mpsc::Receiver<SwapId>) {
        while let Some(swap_id) = done_rx.recv().await {
            if self.swaps.remove(&swap_id).is_some() {
                debug!("Swap {} deregistered", swap_id);
            }
            crate::metrics::set_swaps_running(self.swaps.len() as i64);
        }
        debug!("Swap reaper stopped");
    }

    /// Close every mailbox and wait for the swap tasks to wind down
    pub async fn shutdown(&self) {
        let ids = self.running();
        if ids.is_empty() {
            return;
        }
        info!("Stopping {} running swap(s)", ids.len());

        let mut stopping = Vec::new();
        for swap_id in ids {
            if let Some((_, handle)) = self.swaps.remove(&swap_id) {
                drop(handle.msg_tx);
                stopping.push((swap_id, handle.join));
            }
        }

        let waits = stopping.into_iter().map(|(swap_id, join)| async move {
            let abort = join.abort_handle();
            match timeout(Duration::from_secs(5), join).await {
                Ok(Ok(_)) => debug!("Swap {} stopped", swap_id),
                Ok(Err(e)) => warn!("Swap {} task failed: {}", swap_id, e),
                Err(_) => {
                    warn!("Swap {} did not stop in time", swap_id);
                    abort.abort();
                }
            }
        });
        futures::future::join_all(waits).await;

        crate::metrics::set_swaps_running(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::{DatabaseConfig, SwapConfig};
    use crate::protocol::{
        Address, CommitParams, Network, SwapRole, TradeRole,
    };
    use crate::syncer::TaskEnvelope;
    use crate::wallet::{MockWalletAuthority, WalletRequest, WalletResponse};

    fn params() -> SwapParams {
        SwapParams {
            swap_id: SwapId::random(),
            role: SwapRole::Bob,
            trade_role: TradeRole::Taker,
            network: Network::Local,
            arbitrating_amount: 100_000,
            accordant_amount: 5_000_000,
            arbitrating_finality: 3,
            accordant_finality: 10,
            cancel_timelock: 16,
            punish_timelock: 32,
            sat_per_vbyte: 2,
            remote_commit: None,
        }
    }

    struct Harness {
        manager: SwapManager,
        #[allow(dead_code)]
        syncer_rx: mpsc::Receiver<TaskEnvelope>,
        #[allow(dead_code)]
        peer_rx: mpsc::Receiver<PeerMessage>,
        notice_rx: mpsc::Receiver<SupervisorNotice>,
        #[allow(dead_code)]
        done_rx: mpsc::Receiver<SwapId>,
    }

    async fn harness() -> Harness {
        let mut wallet = MockWalletAuthority::new();
        wallet.expect_request().returning(|_, request| match request {
            WalletRequest::Commit => Ok(WalletResponse::Commit(CommitParams {
                commitment: vec![1],
            })),
            WalletRequest::FundingAddress { leg } => Ok(WalletResponse::Address {
                leg,
                address: Address("bcrt1qtest".to_string()),
            }),
            _ => Ok(WalletResponse::Ack),
        });

        let store = CheckpointStore::new(&DatabaseConfig {
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
        let (done_tx, done_rx) = mpsc::channel(16);

        let services = SwapServices {
            wallet: Arc::new(wallet),
            store: Arc::new(store),
            syncer_tx,
            peer_tx,
            notice_tx,
            done_tx,
            config: SwapConfig {
                mailbox_depth: 16,
                wallet_timeout_ms: 200,
                max_retries: 1,
                retry_delay_ms: 1,
                stall_after_secs: 60,
            },
        };

        Harness {
            manager: SwapManager::new(services),
            syncer_rx,
            peer_rx,
            notice_rx,
            done_rx,
        }
    }

    #[tokio::test]
    async fn test_init_swap_rejects_duplicate() {
        let h = harness().await;
        let params = params();

        h.manager.init_swap(params.clone()).unwrap();
        let err = h.manager.init_swap(params).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::SwapAlreadyRunning { .. }
        ));
        assert_eq!(h.manager.running().len(), 1);
    }

    #[tokio::test]
    async fn test_init_swap_rejects_invalid_params() {
        let h = harness().await;
        let mut params = params();
        params.arbitrating_amount = 0;

        let err = h.manager.init_swap(params).unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
        assert!(h.manager.running().is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_checkpoint_is_an_error() {
        let h = harness().await;
        let swap_id = SwapId::random();

        let err = h.manager.restore_swap(swap_id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::CheckpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_abort_unknown_swap_is_an_error() {
        let h = harness().await;

        let err = h.manager.abort_swap(SwapId::random()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::SwapNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_taker_commit_becomes_a_proposal() {
        let mut h = harness().await;
        let swap_id = SwapId::random();

        h.manager
            .deliver_peer(PeerMessage {
                swap_id,
                body: ProtocolMsg::TakerCommit(CommitParams {
                    commitment: vec![7],
                }),
            })
            .await
            .unwrap();

        match h.notice_rx.recv().await {
            Some(SupervisorNotice::SwapProposed { swap_id: id, .. }) => {
                assert_eq!(id, swap_id)
            }
            other => panic!("expected a proposal notice, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_non_commit_message_is_dropped() {
        let mut h = harness().await;

        h.manager
            .deliver_peer(PeerMessage {
                swap_id: SwapId::random(),
                body: ProtocolMsg::Reveal(crate::protocol::RevealParams {
                    reveal: vec![2],
                }),
            })
            .await
            .unwrap();

        assert!(h.notice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_swaps_reports_running_ids() {
        let mut h = harness().await;
        let params = params();
        let swap_id = params.swap_id;
        h.manager.init_swap(params).unwrap();

        h.manager.handle_ctl(CtlRequest::ListSwaps).await.unwrap();

        // The runtime may emit funding notices first; scan for the reply.
        loop {
            match h.notice_rx.recv().await {
                Some(SupervisorNotice::RunningSwaps { swaps }) => {
                    assert_eq!(swaps, vec![swap_id]);
                    break;
                }
                Some(_) => continue,
                None => panic!("notice channel closed without a reply"),
            }
        }
    }
}
