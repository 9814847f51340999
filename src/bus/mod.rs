//! Service bus wiring
//!
//! swapd talks to its four collaborator daemons over separate line-JSON
//! links: walletd (request/reply), syncerd (tasks out, events in), peerd
//! (protocol messages both ways) and supervisord (notices out, control
//! requests in). This module dials the links and routes inbound frames
//! into the swap manager.

pub mod endpoint;
pub mod wallet;

pub use endpoint::Endpoint;
pub use wallet::WalletClient;

use crate::config::ServicesConfig;
use crate::protocol::PeerMessage;
use crate::supervisor::{CtlRequest, SupervisorNotice};
use crate::swap::manager::SwapManager;
use crate::syncer::{EventEnvelope, TaskEnvelope};
use crate::wallet::{WalletReplyFrame, WalletRequestFrame};

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default bound for the per-link frame queues
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Outbound senders handed to the rest of the daemon
pub struct BusChannels {
    pub wallet: Arc<WalletClient>,
    pub syncer_tx: mpsc::Sender<TaskEnvelope>,
    pub peer_tx: mpsc::Sender<PeerMessage>,
    pub notice_tx: mpsc::Sender<SupervisorNotice>,
}

/// The four collaborator links plus their inbound receivers, held until
/// `serve` attaches them to a manager
pub struct ServiceBus {
    peer_rx: mpsc::Receiver<PeerMessage>,
    syncer_rx: mpsc::Receiver<EventEnvelope>,
    ctl_rx: mpsc::Receiver<CtlRequest>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceBus {
    /// Dial all collaborator endpoints. The links come up lazily; frames
    /// queue on their channels while a link is still connecting.
    pub fn connect(config: &ServicesConfig, depth: usize) -> (Self, BusChannels) {
        let mut tasks = Vec::new();

        // walletd: requests out, correlated replies back in
        let (wallet_req_tx, wallet_req_rx) = mpsc::channel::<WalletRequestFrame>(depth);
        let (wallet_reply_tx, mut wallet_reply_rx) = mpsc::channel::<WalletReplyFrame>(depth);
        tasks.push(tokio::spawn(
            Endpoint::new("walletd", config.walletd.clone()).run(wallet_req_rx, wallet_reply_tx),
        ));
        let wallet = Arc::new(WalletClient::new(wallet_req_tx));
        let reply_client = wallet.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = wallet_reply_rx.recv().await {
                reply_client.dispatch_reply(frame);
            }
            debug!("Wallet reply loop stopped");
        }));

        // syncerd: watch tasks out, chain events in
        let (syncer_tx, syncer_task_rx) = mpsc::channel::<TaskEnvelope>(depth);
        let (syncer_event_tx, syncer_rx) = mpsc::channel::<EventEnvelope>(depth);
        tasks.push(tokio::spawn(
            Endpoint::new("syncerd", config.syncerd.clone()).run(syncer_task_rx, syncer_event_tx),
        ));

        // peerd: protocol messages in both directions
        let (peer_tx, peer_out_rx) = mpsc::channel::<PeerMessage>(depth);
        let (peer_in_tx, peer_rx) = mpsc::channel::<PeerMessage>(depth);
        tasks.push(tokio::spawn(
            Endpoint::new("peerd", config.peerd.clone()).run(peer_out_rx, peer_in_tx),
        ));

        // supervisord: notices out, control requests in
        let (notice_tx, notice_out_rx) = mpsc::channel::<SupervisorNotice>(depth);
        let (ctl_in_tx, ctl_rx) = mpsc::channel::<CtlRequest>(depth);
        tasks.push(tokio::spawn(
            Endpoint::new("supervisord", config.supervisord.clone())
                .run(notice_out_rx, ctl_in_tx),
        ));

        (
            Self {
                peer_rx,
                syncer_rx,
                ctl_rx,
                tasks,
            },
            BusChannels {
                wallet,
                syncer_tx,
                peer_tx,
                notice_tx,
            },
        )
    }

    /// Spawn the inbound dispatch loops against a manager. Returns every
    /// bus task so the caller can abort them on shutdown.
    pub fn serve(self, manager: Arc<SwapManager>) -> Vec<JoinHandle<()>> {
        let ServiceBus {
            mut peer_rx,
            mut syncer_rx,
            mut ctl_rx,
            mut tasks,
        } = self;

        let peer_manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(msg) = peer_rx.recv().await {
                if let Err(e) = peer_manager.deliver_peer(msg).await {
                    warn!("Peer delivery failed: {}", e);
                }
            }
            debug!("Peer dispatch loop stopped");
        }));

        let syncer_manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(envelope) = syncer_rx.recv().await {
                if let Err(e) = syncer_manager.deliver_syncer(envelope).await {
                    warn!("Syncer delivery failed: {}", e);
                }
            }
            debug!("Syncer dispatch loop stopped");
        }));

        tasks.push(tokio::spawn(async move {
            while let Some(request) = ctl_rx.recv().await {
                let kind = request.kind();
                if let Err(e) = manager.handle_ctl(request).await {
                    warn!("Control request {} failed: {}", kind, e);
                }
            }
            debug!("Control dispatch loop stopped");
        }));

        tasks
    }
}
