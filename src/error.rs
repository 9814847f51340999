//! Error types for the Strait swap daemon

use thiserror::Error;

use crate::protocol::SwapId;

/// Main error type for the swap daemon
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bus error for {service}: {message}")]
    Bus { service: String, message: String },

    #[error("{service} unavailable: {message}")]
    CollaboratorUnavailable { service: String, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Duplicate checkpoint {tag} for swap {swap_id}")]
    DuplicateCheckpoint { swap_id: SwapId, tag: String },

    #[error("No checkpoint found for swap {swap_id}")]
    CheckpointNotFound { swap_id: SwapId },

    #[error("Checkpoint for swap {swap_id} cannot be restored: {reason}")]
    InconsistentSnapshot { swap_id: SwapId, reason: String },

    #[error("Swap {swap_id} not found")]
    SwapNotFound { swap_id: SwapId },

    #[error("Swap {swap_id} is already running")]
    SwapAlreadyRunning { swap_id: SwapId },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if error is retryable. Wallet rejections count: walletd says
    /// no when a precondition on its side has not cleared yet, and the same
    /// request is expected to succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Bus { .. }
                | CoordinatorError::CollaboratorUnavailable { .. }
                | CoordinatorError::Timeout { .. }
                | CoordinatorError::Wallet(_)
        )
    }

    /// Check if error must halt the affected swap
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::DuplicateCheckpoint { .. }
                | CoordinatorError::InconsistentSnapshot { .. }
        )
    }
}

/// Errors raised by the per-swap state machine
///
/// Neither variant corrupts the swap: an unexpected event is dropped and the
/// state is left untouched; a missing precondition means the same input can
/// be replayed once the precondition clears.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("Unexpected {input} in state {state}")]
    UnexpectedEvent { state: String, input: String },

    #[error("Cannot act on {input} in state {state}: waiting for {precondition}")]
    MissingPrecondition {
        state: String,
        input: String,
        precondition: String,
    },
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
