//! Request/reply correlation for walletd
//!
//! The wallet link is a plain frame stream, so concurrent swap runtimes
//! multiplex over it with a per-request id. Each in-flight request parks a
//! oneshot sender in the map; the reply dispatcher resolves it by id.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::SwapId;
use crate::wallet::{
    WalletAuthority, WalletReplyFrame, WalletRequest, WalletRequestFrame, WalletResponse,
};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub struct WalletClient {
    req_tx: mpsc::Sender<WalletRequestFrame>,
    pending: DashMap<u64, oneshot::Sender<WalletResponse>>,
    next_id: AtomicU64,
}

/// Removes the pending entry when the request future goes away, replied to
/// or not. Callers time requests out by dropping the future, and that must
/// not leave the id parked forever.
struct PendingGuard<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<WalletResponse>>,
    req_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.req_id);
    }
}

impl WalletClient {
    pub fn new(req_tx: mpsc::Sender<WalletRequestFrame>) -> Self {
        Self {
            req_tx,
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Resolve an inbound reply against its pending request
    pub fn dispatch_reply(&self, frame: WalletReplyFrame) {
        match self.pending.remove(&frame.req_id) {
            Some((_, tx)) => {
                if tx.send(frame.response).is_err() {
                    debug!("Wallet reply {} arrived after the caller gave up", frame.req_id);
                }
            }
            None => {
                debug!("Wallet reply {} matches no pending request", frame.req_id);
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl WalletAuthority for WalletClient {
    async fn request(
        &self,
        swap_id: SwapId,
        request: WalletRequest,
    ) -> CoordinatorResult<WalletResponse> {
        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(req_id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            req_id,
        };

        let frame = WalletRequestFrame {
            req_id,
            swap_id,
            request,
        };
        self.req_tx
            .send(frame)
            .await
            .map_err(|_| CoordinatorError::CollaboratorUnavailable {
                service: "walletd".to_string(),
                message: "request channel closed".to_string(),
            })?;

        rx.await
            .map_err(|_| CoordinatorError::CollaboratorUnavailable {
                service: "walletd".to_string(),
                message: "reply channel dropped".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_reply_is_correlated_by_request_id() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let client = Arc::new(WalletClient::new(req_tx));

        let responder = client.clone();
        tokio::spawn(async move {
            let frame: WalletRequestFrame = req_rx.recv().await.unwrap();
            assert!(matches!(frame.request, WalletRequest::Commit));
            responder.dispatch_reply(WalletReplyFrame {
                req_id: frame.req_id,
                response: WalletResponse::Ack,
            });
        });

        let response = client
            .request(SwapId::random(), WalletRequest::Commit)
            .await
            .unwrap();
        assert!(matches!(response, WalletResponse::Ack));
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_reply_id_is_ignored() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let client = WalletClient::new(req_tx);

        // Nothing pending; this must not panic or park anything.
        client.dispatch_reply(WalletReplyFrame {
            req_id: 42,
            response: WalletResponse::Ack,
        });
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_request_leaves_no_pending_entry() {
        let (req_tx, _req_rx) = mpsc::channel(8);
        let client = WalletClient::new(req_tx);

        // No reply ever comes; the caller gives up and drops the future.
        let result = timeout(
            Duration::from_millis(20),
            client.request(SwapId::random(), WalletRequest::Commit),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(client.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_request_ids_are_distinct() {
        let (req_tx, mut req_rx) = mpsc::channel(8);
        let client = Arc::new(WalletClient::new(req_tx));

        let responder = client.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let frame: WalletRequestFrame = req_rx.recv().await.unwrap();
                assert!(!seen.contains(&frame.req_id));
                seen.push(frame.req_id);
                responder.dispatch_reply(WalletReplyFrame {
                    req_id: frame.req_id,
                    response: WalletResponse::Ack,
                });
            }
        });

        let swap_id = SwapId::random();
        client.request(swap_id, WalletRequest::Commit).await.unwrap();
        client.request(swap_id, WalletRequest::Reveal).await.unwrap();
    }
}
