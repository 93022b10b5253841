//! Domain traits defining contracts for external systems.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{AppError, LedgerError};
use super::ledger::{TokenId, TransferCall, TxReceipt};
use super::signer::Signer;
use super::types::{
    BatchStatus, CustodyRecord, CustodySource, CustodyStatus, NewCustodyRecord, NewUnitBatch,
    PartyRole, UnitBatch,
};

/// Upper bound between receipt polls while waiting for finalization
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Off-chain ledger store
///
/// Status-changing methods are compare-and-set: they return `Ok(false)` when
/// the stored row was not in the expected state, and never partially apply.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Persist a freshly minted batch in `minted` status
    async fn create_batch(&self, batch: &NewUnitBatch) -> Result<UnitBatch, AppError>;

    async fn get_batch(&self, id: &str) -> Result<Option<UnitBatch>, AppError>;

    /// Find the batch recorded for a mint transaction
    async fn get_batch_by_mint_tx(&self, tx_ref: &str) -> Result<Option<UnitBatch>, AppError>;

    /// Move a batch from `from` to `to`
    async fn update_batch_status(
        &self,
        id: &str,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<bool, AppError>;

    /// Persist a draft custody record without token ids
    async fn create_custody_record(
        &self,
        record: &NewCustodyRecord,
    ) -> Result<CustodyRecord, AppError>;

    async fn get_custody_record(&self, id: &str) -> Result<Option<CustodyRecord>, AppError>;

    /// Assign token ids if none are assigned yet; never overwrites
    async fn assign_token_ids_once(
        &self,
        id: &str,
        token_ids: &[TokenId],
    ) -> Result<bool, AppError>;

    /// Remember (or clear) a submitted, not yet finalized, transfer attempt
    async fn set_pending_tx_ref(&self, id: &str, tx_ref: Option<&str>) -> Result<(), AppError>;

    /// Attach a finalized transfer and move `draft -> sent` in one step
    async fn attach_tx_ref_and_advance(&self, id: &str, tx_ref: &str) -> Result<bool, AppError>;

    /// Count a failed attempt and keep its error; returns the attempt count
    async fn record_attempt_failure(&self, id: &str, error: &str) -> Result<i32, AppError>;

    /// Move a custody record from `from` to `to`
    async fn update_record_status(
        &self,
        id: &str,
        from: CustodyStatus,
        to: CustodyStatus,
    ) -> Result<bool, AppError>;

    /// Every custody record drawing units from `source`, cancelled ones included
    async fn list_outbound_records(
        &self,
        source: &CustodySource,
    ) -> Result<Vec<CustodyRecord>, AppError>;
}

/// Token ledger client
///
/// State-changing calls take an explicit [`Signer`]; implementations verify
/// the contract is reachable and the signer holds the role before submitting.
/// The returned reference only acknowledges submission, never finalization.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Check ledger RPC connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Network identifier the endpoint is serving
    async fn chain_id(&self) -> Result<String, AppError>;

    /// Whether contract code exists at `address`
    async fn is_deployed(&self, address: &str) -> Result<bool, AppError>;

    async fn has_role(&self, address: &str, role: PartyRole) -> Result<bool, AppError>;

    /// Quantity of `token_id` held by `address`
    async fn balance_of(&self, address: &str, token_id: TokenId) -> Result<u128, AppError>;

    /// Mint `quantity` units to the signer; returns the transaction reference
    async fn mint(
        &self,
        signer: &Signer,
        quantity: u32,
        metadata_ref: &str,
    ) -> Result<String, AppError>;

    /// Move tokens; single or batch form is picked from the call size
    async fn transfer(
        &self,
        signer: &Signer,
        call: &TransferCall,
        from_role: PartyRole,
    ) -> Result<String, AppError>;

    /// Receipt for a transaction, `None` when the ledger does not know it
    async fn get_receipt(&self, tx_ref: &str) -> Result<Option<TxReceipt>, AppError>;

    /// Confirmations after which a successful receipt counts as final
    fn required_confirmations(&self) -> u64 {
        1
    }

    /// Poll until the transaction is finalized, reverted, or `timeout` passes.
    ///
    /// A timeout yields `LedgerError::NotFinalized`; the transaction may still
    /// finalize later.
    async fn wait_for_finalization(
        &self,
        tx_ref: &str,
        timeout: Duration,
    ) -> Result<TxReceipt, AppError> {
        let start = Instant::now();
        let poll_interval = timeout.min(MAX_POLL_INTERVAL);
        let required = self.required_confirmations();

        loop {
            match self.get_receipt(tx_ref).await {
                Ok(Some(receipt)) if receipt.is_reverted() => {
                    return Err(AppError::Ledger(LedgerError::Reverted {
                        tx_ref: tx_ref.to_string(),
                        reason: receipt
                            .revert_reason
                            .unwrap_or_else(|| "no reason given".to_string()),
                    }));
                }
                Ok(Some(receipt)) if receipt.is_finalized(required) => {
                    info!(tx_ref = %tx_ref, confirmations = receipt.confirmations, "Transaction finalized");
                    return Ok(receipt);
                }
                Ok(_) => {
                    debug!(tx_ref = %tx_ref, "Transaction not yet finalized");
                }
                Err(e) => {
                    warn!(tx_ref = %tx_ref, error = ?e, "Error fetching receipt");
                }
            }

            if start.elapsed() >= timeout {
                return Err(AppError::Ledger(LedgerError::NotFinalized {
                    tx_ref: tx_ref.to_string(),
                    timeout_secs: timeout.as_secs(),
                }));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
