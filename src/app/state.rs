//! Application state management.

use std::sync::Arc;

use crate::domain::{AppError, DatabaseClient, LedgerClient, Signer};
use crate::infra::SignerRegistry;

use super::orchestrator::{OrchestratorConfig, TransferOrchestrator};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TransferOrchestrator>,
    /// Keys of the parties this relayer signs for
    pub signers: Arc<SignerRegistry>,
}

impl AppState {
    /// Create a new application state with default orchestrator tuning
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        ledger_client: Arc<dyn LedgerClient>,
        signers: SignerRegistry,
    ) -> Self {
        Self::with_config(db_client, ledger_client, signers, OrchestratorConfig::default())
    }

    #[must_use]
    pub fn with_config(
        db_client: Arc<dyn DatabaseClient>,
        ledger_client: Arc<dyn LedgerClient>,
        signers: SignerRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            orchestrator: Arc::new(TransferOrchestrator::new(db_client, ledger_client, config)),
            signers: Arc::new(signers),
        }
    }

    /// Signer for a party address, or an authorization error
    pub fn signer_for(&self, address: &str) -> Result<&Signer, AppError> {
        self.signers.require(address)
    }
}
