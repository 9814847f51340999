//! Buffer for peer messages that arrive before the swap can act on them
//!
//! Bob cannot process the counterparty reveal until his funding is complete,
//! but the peer is free to send it earlier. The buffer holds at most one
//! message per kind - a retransmission replaces the held copy, it is not a
//! new fact - and flushes in protocol order, proof before reveal. Flushing
//! an empty buffer is a no-op by design.

use crate::protocol::ProtocolMsg;

use std::collections::BTreeMap;

/// Bufferable message kinds, ordered by required delivery order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PendingKind {
    RevealProof,
    Reveal,
}

impl PendingKind {
    /// Classify a message, if it is bufferable at all
    pub fn of(msg: &ProtocolMsg) -> Option<Self> {
        match msg {
            ProtocolMsg::RevealProof(_) => Some(PendingKind::RevealProof),
            ProtocolMsg::Reveal(_) => Some(PendingKind::Reveal),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PendingKind::RevealProof => "reveal_proof",
            PendingKind::Reveal => "reveal",
        }
    }
}

/// At most one held message per kind
#[derive(Debug, Default)]
pub struct PendingBuffer {
    slots: BTreeMap<PendingKind, ProtocolMsg>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a checkpoint snapshot. Entries that are not bufferable
    /// kinds are silently skipped; the snapshot writer never produces them.
    pub fn restore(msgs: Vec<ProtocolMsg>) -> Self {
        let mut buffer = Self::new();
        for msg in msgs {
            if let Some(kind) = PendingKind::of(&msg) {
                buffer.hold(kind, msg);
            }
        }
        buffer
    }

    /// Hold a message, replacing any earlier message of the same kind.
    /// Returns the replaced message if there was one.
    pub fn hold(&mut self, kind: PendingKind, msg: ProtocolMsg) -> Option<ProtocolMsg> {
        self.slots.insert(kind, msg)
    }

    /// Remove and return everything in delivery order
    pub fn flush(&mut self) -> Vec<ProtocolMsg> {
        let drained: Vec<ProtocolMsg> = std::mem::take(&mut self.slots).into_values().collect();
        drained
    }

    /// Held messages in delivery order, for checkpoint snapshots
    pub fn snapshot(&self) -> Vec<ProtocolMsg> {
        self.slots.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Proof, RevealParams};

    fn proof_msg(byte: u8) -> ProtocolMsg {
        ProtocolMsg::RevealProof(Proof { proof: vec![byte] })
    }

    fn reveal_msg(byte: u8) -> ProtocolMsg {
        ProtocolMsg::Reveal(RevealParams { reveal: vec![byte] })
    }

    #[test]
    fn test_flush_orders_proof_before_reveal() {
        let mut buffer = PendingBuffer::new();
        // Held in the wrong order on purpose.
        buffer.hold(PendingKind::Reveal, reveal_msg(2));
        buffer.hold(PendingKind::RevealProof, proof_msg(1));

        let flushed = buffer.flush();
        assert_eq!(flushed.len(), 2);
        assert!(matches!(flushed[0], ProtocolMsg::RevealProof(_)));
        assert!(matches!(flushed[1], ProtocolMsg::Reveal(_)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_retransmission_replaces_held_copy() {
        let mut buffer = PendingBuffer::new();
        assert!(buffer.hold(PendingKind::Reveal, reveal_msg(1)).is_none());
        let replaced = buffer.hold(PendingKind::Reveal, reveal_msg(2));
        assert!(replaced.is_some());
        assert_eq!(buffer.len(), 1);

        let flushed = buffer.flush();
        match &flushed[0] {
            ProtocolMsg::Reveal(params) => assert_eq!(params.reveal, vec![2]),
            other => panic!("unexpected message: {}", other.kind()),
        }
    }

    #[test]
    fn test_empty_flush_is_noop() {
        let mut buffer = PendingBuffer::new();
        assert!(buffer.flush().is_empty());
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut buffer = PendingBuffer::new();
        buffer.hold(PendingKind::RevealProof, proof_msg(7));
        buffer.hold(PendingKind::Reveal, reveal_msg(8));

        let restored = PendingBuffer::restore(buffer.snapshot());
        assert_eq!(restored.len(), 2);
        let flushed = PendingBuffer::restore(restored.snapshot()).flush();
        assert!(matches!(flushed[0], ProtocolMsg::RevealProof(_)));
    }

    #[test]
    fn test_non_bufferable_kinds_are_rejected() {
        use crate::protocol::CommitParams;
        let commit = ProtocolMsg::TakerCommit(CommitParams {
            commitment: vec![],
        });
        assert!(PendingKind::of(&commit).is_none());
    }
}
