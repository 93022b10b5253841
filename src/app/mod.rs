//! Application layer containing business logic and shared state.

pub mod balance;
pub mod inflight;
pub mod orchestrator;
pub mod resolver;
pub mod state;

pub use balance::BalanceVerifier;
pub use inflight::{InFlightGuard, InFlightRegistry};
pub use orchestrator::{OrchestratorConfig, TransferOrchestrator};
pub use resolver::{ExtractionStrategy, Resolution, TokenIdResolver};
pub use state::AppState;
