//! Swap execution: state machine, per-swap runtime and the registry that
//! routes bus traffic to running swaps

pub mod machine;
pub mod manager;
pub mod pending;
pub mod runtime;
pub mod state;

pub use machine::{Action, ChainInput, SwapInput, SwapMachine};
pub use manager::SwapManager;
pub use pending::{PendingBuffer, PendingKind};
pub use runtime::{RuntimeMsg, SwapRuntime, SwapServices};
pub use state::{AliceState, BobState, SwapState};
