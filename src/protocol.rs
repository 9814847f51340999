//! Swap identifiers, roles, and peer protocol messages
//!
//! Transaction payloads are opaque to the daemon: walletd produces and
//! consumes the actual bytes, the coordinator only routes on swap id, label
//! and txid. Replayed artifacts may carry different bytes for the same
//! logical content (fresh signature nonces), so nothing here compares raw
//! payloads for equality.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a swap, present on every message, event and
/// checkpoint record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapId(pub Uuid);

impl SwapId {
    pub fn random() -> Self {
        SwapId(Uuid::new_v4())
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SwapId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SwapId(Uuid::from_str(s)?))
    }
}

/// Protocol role, fixed for the lifetime of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapRole {
    /// Holds the accordant asset, ends with the arbitrating one
    Alice,
    /// Holds the arbitrating asset, funds the lock transaction
    Bob,
}

impl fmt::Display for SwapRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapRole::Alice => write!(f, "Alice"),
            SwapRole::Bob => write!(f, "Bob"),
        }
    }
}

/// Negotiation role: the taker commits first, the maker counter-commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeRole {
    Maker,
    Taker,
}

impl fmt::Display for TradeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeRole::Maker => write!(f, "Maker"),
            TradeRole::Taker => write!(f, "Taker"),
        }
    }
}

/// Network a swap runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet,
    Local,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Local => write!(f, "local"),
        }
    }
}

/// Which chain a watch or funding request refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SwapLeg {
    Arbitrating,
    Accordant,
}

impl fmt::Display for SwapLeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapLeg::Arbitrating => write!(f, "arbitrating"),
            SwapLeg::Accordant => write!(f, "accordant"),
        }
    }
}

/// Terminal classification of a swap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Happy path: buy transaction final, assets exchanged
    Buy,
    /// Cancel path: arbitrating funds returned to Bob
    Refund,
    /// Cancel path escalated: Alice claimed Bob's funds after his refund
    /// window lapsed
    Punish,
    /// Terminated before any lock was committed to
    Abort,
}

impl Outcome {
    /// Outcome name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Buy => "buy",
            Outcome::Refund => "refund",
            Outcome::Punish => "punish",
            Outcome::Abort => "abort",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Label of a protocol transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxLabel {
    Funding,
    Lock,
    Cancel,
    Refund,
    Buy,
    Punish,
    AccordantLock,
}

impl TxLabel {
    /// Label name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            TxLabel::Funding => "funding",
            TxLabel::Lock => "lock",
            TxLabel::Cancel => "cancel",
            TxLabel::Refund => "refund",
            TxLabel::Buy => "buy",
            TxLabel::Punish => "punish",
            TxLabel::AccordantLock => "accordant_lock",
        }
    }

    /// Which leg this transaction settles on
    pub fn leg(&self) -> SwapLeg {
        match self {
            TxLabel::AccordantLock => SwapLeg::Accordant,
            _ => SwapLeg::Arbitrating,
        }
    }
}

impl fmt::Display for TxLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Transaction identifier, opaque 32 bytes rendered as hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(#[serde(with = "hex::serde")] pub [u8; 32]);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Chain address, opaque to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub String);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unsigned or partially signed transaction produced by walletd
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxTemplate {
    pub txid: TxId,
    #[serde(with = "hex::serde")]
    pub raw: Vec<u8>,
}

/// Fully signed transaction ready for broadcast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTx {
    pub label: TxLabel,
    pub txid: TxId,
    #[serde(with = "hex::serde")]
    pub raw: Vec<u8>,
}

/// Commitment to session parameters, exchanged before any reveal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitParams {
    #[serde(with = "hex::serde")]
    pub commitment: Vec<u8>,
}

/// Revealed session parameters, validated against the prior commitment by
/// walletd
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealParams {
    #[serde(with = "hex::serde")]
    pub reveal: Vec<u8>,
}

/// Cross-group discrete logarithm proof accompanying a reveal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    #[serde(with = "hex::serde")]
    pub proof: Vec<u8>,
}

/// Bob's arbitrating transaction set: lock, cancel and refund templates plus
/// his signature on cancel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreArbitratingSetup {
    pub lock: TxTemplate,
    pub cancel: TxTemplate,
    pub refund: TxTemplate,
    #[serde(with = "hex::serde")]
    pub cancel_sig: Vec<u8>,
}

/// Alice's counter-signatures protecting Bob's refund path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundProcedureSignatures {
    #[serde(with = "hex::serde")]
    pub cancel_sig: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub refund_adaptor_sig: Vec<u8>,
}

/// Bob's buy template and adaptor signature, released to Alice once the
/// accordant lock is final
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyProcedureSignature {
    pub buy: TxTemplate,
    #[serde(with = "hex::serde")]
    pub buy_adaptor_sig: Vec<u8>,
}

/// Protocol messages exchanged between swap counterparties
///
/// The same bodies travel on the wallet leg: Bob's own
/// `CoreArbitratingSetup` and `BuyProcedureSignature` are produced by his
/// walletd, Alice's `RefundProcedureSignatures` by hers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProtocolMsg {
    TakerCommit(CommitParams),
    MakerCommit(CommitParams),
    RevealProof(Proof),
    Reveal(RevealParams),
    CoreArbitratingSetup(CoreArbitratingSetup),
    RefundProcedureSignatures(RefundProcedureSignatures),
    BuyProcedureSignature(BuyProcedureSignature),
}

impl ProtocolMsg {
    /// Message name for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMsg::TakerCommit(_) => "taker_commit",
            ProtocolMsg::MakerCommit(_) => "maker_commit",
            ProtocolMsg::RevealProof(_) => "reveal_proof",
            ProtocolMsg::Reveal(_) => "reveal",
            ProtocolMsg::CoreArbitratingSetup(_) => "core_arbitrating_setup",
            ProtocolMsg::RefundProcedureSignatures(_) => "refund_procedure_signatures",
            ProtocolMsg::BuyProcedureSignature(_) => "buy_procedure_signature",
        }
    }
}

/// Envelope framing a protocol message on the peer bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMessage {
    pub swap_id: SwapId,
    pub body: ProtocolMsg,
}

/// Where a protocol message entered the daemon from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgSource {
    Peer,
    Wallet,
}

impl fmt::Display for MsgSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgSource::Peer => write!(f, "peer"),
            MsgSource::Wallet => write!(f, "wallet"),
        }
    }
}

/// Parameters fixed at swap initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapParams {
    pub swap_id: SwapId,
    pub role: SwapRole,
    pub trade_role: TradeRole,
    pub network: Network,
    /// Arbitrating amount in its smallest unit
    pub arbitrating_amount: u64,
    /// Accordant amount in its smallest unit
    pub accordant_amount: u64,
    /// Confirmation depth treated as final on the arbitrating chain
    pub arbitrating_finality: u32,
    /// Confirmation depth treated as final on the accordant chain
    pub accordant_finality: u32,
    /// Blocks after lock finality before cancel becomes valid
    pub cancel_timelock: u32,
    /// Blocks after cancel finality before punish becomes valid
    pub punish_timelock: u32,
    /// Fee hint forwarded to walletd when finalizing templates
    pub sat_per_vbyte: u64,
    /// Counterparty commitment, present when the maker accepts a taken offer
    pub remote_commit: Option<CommitParams>,
}

impl SwapParams {
    /// Validate negotiated parameters before starting a swap
    pub fn validate(&self) -> Result<(), String> {
        if self.arbitrating_amount == 0 || self.accordant_amount == 0 {
            return Err("swap amounts must be non-zero".into());
        }
        if self.arbitrating_finality == 0 {
            return Err("arbitrating finality depth must be at least 1".into());
        }
        if self.cancel_timelock == 0 || self.punish_timelock == 0 {
            return Err("timelocks must be non-zero".into());
        }
        match (self.trade_role, &self.remote_commit) {
            (TradeRole::Maker, None) => {
                Err("maker swaps start from a taker commitment".into())
            }
            (TradeRole::Taker, Some(_)) => {
                Err("taker swaps cannot carry a remote commitment".into())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txid_renders_as_hex() {
        let txid = TxId([0xab; 32]);
        assert_eq!(txid.to_string(), "ab".repeat(32));
    }

    #[test]
    fn test_peer_message_envelope_serde() {
        let msg = PeerMessage {
            swap_id: SwapId::random(),
            body: ProtocolMsg::TakerCommit(CommitParams {
                commitment: vec![1, 2, 3],
            }),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("TakerCommit"));
        assert!(json.contains("010203"));
        let back: PeerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.swap_id, msg.swap_id);
        assert_eq!(back.body.kind(), "taker_commit");
    }

    #[test]
    fn test_params_validation() {
        let mut params = SwapParams {
            swap_id: SwapId::random(),
            role: SwapRole::Bob,
            trade_role: TradeRole::Taker,
            network: Network::Testnet,
            arbitrating_amount: 100_000,
            accordant_amount: 5_000_000,
            arbitrating_finality: 3,
            accordant_finality: 10,
            cancel_timelock: 16,
            punish_timelock: 32,
            sat_per_vbyte: 2,
            remote_commit: None,
        };
        assert!(params.validate().is_ok());

        params.cancel_timelock = 0;
        assert!(params.validate().is_err());

        params.cancel_timelock = 16;
        params.remote_commit = Some(CommitParams {
            commitment: vec![0xcc],
        });
        // A taker starts the dance; holding a counterparty commitment
        // already is a maker-only situation.
        assert!(params.validate().is_err());
        params.trade_role = TradeRole::Maker;
        assert!(params.validate().is_ok());
    }
}
