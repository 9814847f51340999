//! Wallet authority port
//!
//! walletd holds every key and produces every signature. The daemon never
//! derives or signs anything itself: it forwards counterparty material as it
//! arrives, requests artifacts when the protocol needs them, and broadcasts
//! what comes back fully signed. The port is a single request/response
//! method; the bus client adds correlation ids, timeouts and retries.

use crate::error::CoordinatorResult;
use crate::protocol::{
    Address, BuyProcedureSignature, CommitParams, CoreArbitratingSetup, Proof,
    RefundProcedureSignatures, RevealParams, SignedTx, SwapId, SwapLeg, TxId, TxLabel,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Requests the coordinator makes to walletd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalletRequest {
    /// Commitment over the local session parameters
    Commit,

    /// Counterparty commitment, forwarded on arrival
    RemoteCommit { commit: CommitParams },

    /// Reveal and proof for the local session parameters
    Reveal,

    /// Counterparty proof, forwarded on arrival
    RemoteRevealProof { proof: Proof },

    /// Counterparty reveal, forwarded on arrival
    RemoteReveal { reveal: RevealParams },

    /// Address to be funded on the given leg
    FundingAddress { leg: SwapLeg },

    /// Joint accordant lock address, derivable once both sides revealed
    AccordantLockAddress,

    /// Bob: build the lock/cancel/refund templates from the forwarded reveal
    CoreArbitratingSetup,

    /// Alice: counter-sign Bob's cancel and refund
    RefundProcedureSignatures { setup: CoreArbitratingSetup },

    /// Bob: produce the buy template and adaptor signature
    BuyProcedureSignature {
        signatures: RefundProcedureSignatures,
    },

    /// Alice: adapt and finalize the received buy signature for broadcast
    FullySignedBuy {
        sig: BuyProcedureSignature,
        sat_per_vbyte: u64,
    },

    /// Finalize a known template into a broadcastable transaction
    FullySignedTx { label: TxLabel, sat_per_vbyte: u64 },

    /// Funding landed on-chain; rebind templates to the funding outpoint
    FundingUpdated { leg: SwapLeg, txid: TxId },
}

impl WalletRequest {
    /// Request name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            WalletRequest::Commit => "commit",
            WalletRequest::RemoteCommit { .. } => "remote_commit",
            WalletRequest::Reveal => "reveal",
            WalletRequest::RemoteRevealProof { .. } => "remote_reveal_proof",
            WalletRequest::RemoteReveal { .. } => "remote_reveal",
            WalletRequest::FundingAddress { .. } => "funding_address",
            WalletRequest::AccordantLockAddress => "accordant_lock_address",
            WalletRequest::CoreArbitratingSetup => "core_arbitrating_setup",
            WalletRequest::RefundProcedureSignatures { .. } => "refund_procedure_signatures",
            WalletRequest::BuyProcedureSignature { .. } => "buy_procedure_signature",
            WalletRequest::FullySignedBuy { .. } => "fully_signed_buy",
            WalletRequest::FullySignedTx { .. } => "fully_signed_tx",
            WalletRequest::FundingUpdated { .. } => "funding_updated",
        }
    }
}

/// Responses from walletd
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalletResponse {
    Commit(CommitParams),
    Reveal { proof: Proof, reveal: RevealParams },
    Address { leg: SwapLeg, address: Address },
    CoreArbitratingSetup(CoreArbitratingSetup),
    RefundProcedureSignatures(RefundProcedureSignatures),
    BuyProcedureSignature(BuyProcedureSignature),
    FullySignedTx(SignedTx),
    Ack,
    Failure { reason: String },
}

impl WalletResponse {
    /// Response name for logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            WalletResponse::Commit(_) => "commit",
            WalletResponse::Reveal { .. } => "reveal",
            WalletResponse::Address { .. } => "address",
            WalletResponse::CoreArbitratingSetup(_) => "core_arbitrating_setup",
            WalletResponse::RefundProcedureSignatures(_) => "refund_procedure_signatures",
            WalletResponse::BuyProcedureSignature(_) => "buy_procedure_signature",
            WalletResponse::FullySignedTx(_) => "fully_signed_tx",
            WalletResponse::Ack => "ack",
            WalletResponse::Failure { .. } => "failure",
        }
    }
}

/// The wallet port consumed by swap runtimes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletAuthority: Send + Sync {
    async fn request(
        &self,
        swap_id: SwapId,
        request: WalletRequest,
    ) -> CoordinatorResult<WalletResponse>;
}

/// Frame carrying a wallet request on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRequestFrame {
    pub req_id: u64,
    pub swap_id: SwapId,
    pub request: WalletRequest,
}

/// Frame carrying a wallet reply back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletReplyFrame {
    pub req_id: u64,
    pub response: WalletResponse,
}
