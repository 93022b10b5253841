//! Transfer orchestrator: mint-and-record and transfer-and-record workflows.
//!
//! Each workflow persists a resume point before it depends on the ledger
//! (`mint_tx_ref` for mints, `pending_tx_ref` for transfers), so a failed or
//! abandoned step is resumed by calling the same operation again instead of
//! being restarted. Nothing off-chain advances before the ledger reports the
//! transaction finalized.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use validator::Validate;

use crate::domain::{
    AppError, BalanceCheck, BatchStatus, CheckBalancesRequest, CreateTransferRequest,
    CreateTransferResponse, CustodyRecord, CustodySource, CustodyStatus, DatabaseClient,
    HealthResponse, HealthStatus, InconsistencyKind, LedgerClient, LedgerError, MintBatchRequest,
    NewCustodyRecord, PartyRole, RecoverMintRequest, Signer, SubmitOutcome,
    SubmitTransferResponse, TokenId, TransferCall, TxReceipt, UnitBatch, ValidationError,
};

use super::balance::BalanceVerifier;
use super::inflight::InFlightRegistry;
use super::resolver::{Resolution, TokenIdResolver};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a call waits for finalization before reporting `pending`
    pub finalization_timeout: Duration,
    /// Receipt reads made while token ids stay under-resolved
    pub resolve_attempts: u32,
    /// Pause between receipt re-reads
    pub requery_delay: Duration,
    /// Persist gap-filled token ids instead of reporting an inconsistency
    pub accept_inferred_token_ids: bool,
    /// How long a submitted transfer may stay unknown to the ledger before
    /// it counts as dropped and the record may be resubmitted
    pub unknown_attempt_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            finalization_timeout: Duration::from_secs(60),
            resolve_attempts: 3,
            requery_delay: Duration::from_secs(2),
            accept_inferred_token_ids: false,
            unknown_attempt_grace: Duration::from_secs(600),
        }
    }
}

/// Units a custody record may draw from
struct SourcePool {
    address: String,
    role: PartyRole,
    token_ids: Vec<TokenId>,
    batch_status: Option<BatchStatus>,
}

/// Drives custody workflows across the off-chain store and the token ledger
pub struct TransferOrchestrator {
    db_client: Arc<dyn DatabaseClient>,
    ledger_client: Arc<dyn LedgerClient>,
    verifier: BalanceVerifier,
    config: OrchestratorConfig,
    in_flight: InFlightRegistry,
    pool_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TransferOrchestrator {
    #[must_use]
    pub fn new(
        db_client: Arc<dyn DatabaseClient>,
        ledger_client: Arc<dyn LedgerClient>,
        config: OrchestratorConfig,
    ) -> Self {
        let verifier = BalanceVerifier::new(Arc::clone(&ledger_client));
        Self {
            db_client,
            ledger_client,
            verifier,
            config,
            in_flight: InFlightRegistry::new(),
            pool_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_defaults(
        db_client: Arc<dyn DatabaseClient>,
        ledger_client: Arc<dyn LedgerClient>,
    ) -> Self {
        Self::new(db_client, ledger_client, OrchestratorConfig::default())
    }

    // ------------------------------------------------------------------
    // Workflow A: mint batch
    // ------------------------------------------------------------------

    /// Mint `quantity` unit tokens and record the batch with their ids.
    ///
    /// A failed mint call leaves nothing behind and may be retried as is.
    /// Once the mint is submitted, failures are reported as recoverable
    /// inconsistencies carrying the tx ref for [`Self::recover_mint`].
    #[instrument(skip(self, signer, request), fields(producer = %request.producer_address, quantity = request.quantity))]
    pub async fn mint_batch(
        &self,
        signer: &Signer,
        request: &MintBatchRequest,
    ) -> Result<UnitBatch, AppError> {
        validate_mint_request(request)?;
        if signer.address() != request.producer_address {
            return Err(AppError::Authorization(format!(
                "Signer {} cannot mint for producer {}",
                signer.address(),
                request.producer_address
            )));
        }

        let tx_ref = self
            .ledger_client
            .mint(signer, request.quantity, &request.metadata_ref)
            .await
            .map_err(|e| {
                warn!(error = %e, "Mint submission failed; nothing persisted");
                e
            })?;
        info!(tx_ref = %tx_ref, "Mint submitted");

        self.finalize_mint(request, &tx_ref).await
    }

    /// Finish a mint whose ledger transaction was already submitted.
    ///
    /// Re-reads the receipt and never mints again. Returns the existing batch
    /// when the mint was already recorded.
    #[instrument(skip(self, request), fields(tx_ref = %request.tx_ref))]
    pub async fn recover_mint(&self, request: &RecoverMintRequest) -> Result<UnitBatch, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        validate_mint_request(&request.batch)?;
        self.finalize_mint(&request.batch, &request.tx_ref).await
    }

    async fn finalize_mint(
        &self,
        request: &MintBatchRequest,
        tx_ref: &str,
    ) -> Result<UnitBatch, AppError> {
        let not_recorded = |e: AppError| {
            AppError::inconsistency(
                InconsistencyKind::MintNotRecorded,
                tx_ref,
                None,
                "batch recorded for finalized mint",
                e.to_string(),
            )
        };

        if let Some(existing) = self
            .db_client
            .get_batch_by_mint_tx(tx_ref)
            .await
            .map_err(not_recorded)?
        {
            info!(batch_id = %existing.id, "Mint already recorded");
            return Ok(existing);
        }

        let receipt = match self
            .ledger_client
            .wait_for_finalization(tx_ref, self.config.finalization_timeout)
            .await
        {
            Ok(receipt) => receipt,
            Err(e @ AppError::Ledger(LedgerError::Reverted { .. })) => {
                warn!(error = %e, "Mint reverted; nothing persisted");
                return Err(e);
            }
            Err(e) => {
                return Err(AppError::inconsistency(
                    InconsistencyKind::MintUnresolved,
                    tx_ref,
                    None,
                    "finalized mint receipt",
                    e.to_string(),
                ));
            }
        };

        let quantity = request.quantity as usize;
        let token_ids = self.resolve_mint_ids(tx_ref, receipt, quantity).await?;

        if token_ids.len() != quantity || !token_ids.windows(2).all(|w| w[0] < w[1]) {
            error!(resolved = token_ids.len(), quantity, "Resolved token ids violate batch invariant");
            return Err(AppError::Invariant(format!(
                "mint {} resolved {} token ids for {} units, or ids are not strictly ascending",
                tx_ref,
                token_ids.len(),
                quantity
            )));
        }

        let new_batch = request.to_new_batch(token_ids, tx_ref);
        match self.db_client.create_batch(&new_batch).await {
            Ok(batch) => {
                info!(batch_id = %batch.id, tx_ref = %tx_ref, "Batch recorded");
                Ok(batch)
            }
            Err(AppError::Database(crate::domain::DatabaseError::Duplicate(_))) => {
                // lost a race with a concurrent recovery of the same mint
                self.db_client
                    .get_batch_by_mint_tx(tx_ref)
                    .await
                    .map_err(not_recorded)?
                    .ok_or_else(|| {
                        not_recorded(AppError::Internal("duplicate batch not found".to_string()))
                    })
            }
            Err(e) => {
                error!(tx_ref = %tx_ref, error = %e, "Mint finalized but batch not recorded");
                Err(not_recorded(e))
            }
        }
    }

    /// Resolve token ids, re-reading the receipt while they stay incomplete
    async fn resolve_mint_ids(
        &self,
        tx_ref: &str,
        mut receipt: TxReceipt,
        quantity: usize,
    ) -> Result<Vec<TokenId>, AppError> {
        let attempts = self.config.resolve_attempts.max(1);
        let mut attempt = 1;

        loop {
            let resolution = TokenIdResolver::resolve(&receipt, quantity);
            match resolution {
                Resolution::Complete {
                    token_ids,
                    strategy,
                    trimmed,
                } => {
                    if trimmed > 0 {
                        warn!(tx_ref = %tx_ref, trimmed, "Mint emitted more token ids than requested");
                    }
                    info!(tx_ref = %tx_ref, %strategy, "Token ids resolved");
                    return Ok(token_ids);
                }
                _ if attempt < attempts => {
                    warn!(tx_ref = %tx_ref, attempt, "Token ids incomplete; re-reading receipt");
                    tokio::time::sleep(self.config.requery_delay).await;
                    receipt = self.requery_mint_receipt(tx_ref, receipt).await?;
                    attempt += 1;
                }
                Resolution::GapFilled {
                    token_ids,
                    inferred,
                    strategy,
                } => {
                    if self.config.accept_inferred_token_ids {
                        warn!(tx_ref = %tx_ref, inferred, %strategy, "Accepting inferred token ids");
                        return Ok(token_ids);
                    }
                    return Err(AppError::inconsistency(
                        InconsistencyKind::MintUnresolved,
                        tx_ref,
                        None,
                        format!("{} token ids in mint events", quantity),
                        format!("{} token ids in mint events", quantity - inferred),
                    ));
                }
                Resolution::Unresolved { requested } => {
                    error!(tx_ref = %tx_ref, requested, "Mint receipt carries no token ids");
                    return Err(AppError::Invariant(format!(
                        "mint {} emitted no token ids for {} units",
                        tx_ref, requested
                    )));
                }
            }
        }
    }

    async fn requery_mint_receipt(
        &self,
        tx_ref: &str,
        previous: TxReceipt,
    ) -> Result<TxReceipt, AppError> {
        match self.ledger_client.get_receipt(tx_ref).await {
            Ok(Some(receipt)) => Ok(receipt),
            Ok(None) => Ok(previous),
            Err(e) => Err(AppError::inconsistency(
                InconsistencyKind::MintUnresolved,
                tx_ref,
                None,
                "finalized mint receipt",
                e.to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Workflow B: custody transfer
    // ------------------------------------------------------------------

    /// Create a draft custody record and assign it token ids from the source.
    #[instrument(skip(self, request), fields(source = %request.source.pool_key(), quantity = request.quantity))]
    pub async fn create_transfer(
        &self,
        request: &CreateTransferRequest,
    ) -> Result<CreateTransferResponse, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
        if request.destination_role == PartyRole::Producer {
            return Err(AppError::invalid_field(
                "destination_role",
                "Units cannot be transferred back to a producer",
            ));
        }

        let lock = self.pool_lock(&request.source);
        let _pool_guard = lock.lock().await;

        let pool = self.source_pool(&request.source).await?;
        if pool.address == request.destination_address {
            return Err(AppError::invalid_field(
                "destination_address",
                "Destination must differ from the source holder",
            ));
        }
        let selected = self
            .select_token_ids(&request.source, &pool, request.quantity)
            .await?;

        let record = self
            .db_client
            .create_custody_record(&NewCustodyRecord {
                source: request.source.clone(),
                source_address: pool.address.clone(),
                destination_address: request.destination_address.clone(),
                destination_role: request.destination_role,
                quantity: request.quantity,
            })
            .await?;

        if !self
            .db_client
            .assign_token_ids_once(&record.id, &selected)
            .await?
        {
            return Err(AppError::Invariant(format!(
                "fresh custody record {} already had token ids",
                record.id
            )));
        }

        if let (CustodySource::Batch { batch_id }, Some(BatchStatus::Minted)) =
            (&request.source, pool.batch_status)
        {
            self.db_client
                .update_batch_status(batch_id, BatchStatus::Minted, BatchStatus::TransferPending)
                .await?;
        }

        info!(record_id = %record.id, "Draft custody record created");
        Ok(CreateTransferResponse {
            record_id: record.id,
            status: CustodyStatus::Draft,
            selected_token_ids: selected,
        })
    }

    /// Submit a draft record's transfer and attach it once finalized.
    ///
    /// Safe to call repeatedly: an already finalized record is returned
    /// unchanged and a previously submitted attempt is reconciled before
    /// anything new is sent to the ledger.
    #[instrument(skip(self, signer), fields(signer = %signer.address()))]
    pub async fn submit_transfer(
        &self,
        signer: &Signer,
        record_id: &str,
    ) -> Result<SubmitTransferResponse, AppError> {
        let _guard = self
            .in_flight
            .try_acquire(record_id)
            .ok_or_else(|| AppError::TransferInFlight(record_id.to_string()))?;

        let mut record = self.require_record(record_id).await?;

        if record.status.has_finalized_transfer() {
            info!(tx_ref = ?record.tx_ref, "Transfer already finalized; nothing submitted");
            return Ok(submit_response(&record, SubmitOutcome::AlreadyFinalized));
        }
        if record.status != CustodyStatus::Draft {
            return Err(invalid_record_transition(record.status, CustodyStatus::Sent));
        }
        if signer.address() != record.source_address {
            return Err(AppError::Authorization(format!(
                "Signer {} does not hold the units of custody record {}",
                signer.address(),
                record.id
            )));
        }

        if let Some(pending) = record.pending_tx_ref.clone() {
            if let Some(response) = self.reconcile_pending(&record, &pending).await? {
                return Ok(response);
            }
            record.pending_tx_ref = None;
        }

        if !record.has_token_ids() {
            record = self.resume_token_assignment(record).await?;
        }

        let source_role = self.source_role(&record.source).await?;

        let check = self
            .verifier
            .verify_units(&record.source_address, &record.token_ids)
            .await?;
        if !check.can_transfer {
            warn!(shortfalls = check.shortfalls.len(), "Insufficient balance; transfer not submitted");
            return Err(AppError::InsufficientBalance {
                record_id: record.id,
                shortfalls: check.shortfalls,
            });
        }

        let call = TransferCall::units(
            &record.source_address,
            &record.destination_address,
            &record.token_ids,
        );
        let tx_ref = match self.ledger_client.transfer(signer, &call, source_role).await {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                self.note_failure(&record.id, &e).await;
                return Err(e);
            }
        };
        info!(tx_ref = %tx_ref, units = call.token_ids.len(), "Transfer submitted");

        if let Err(e) = self
            .db_client
            .set_pending_tx_ref(&record.id, Some(&tx_ref))
            .await
        {
            error!(tx_ref = %tx_ref, error = %e, "Transfer submitted but its reference was not persisted");
            return Err(AppError::inconsistency(
                InconsistencyKind::TransferNotRecorded,
                &tx_ref,
                Some(record.id.clone()),
                "pending tx ref persisted on custody record",
                e.to_string(),
            ));
        }
        record.pending_tx_ref = Some(tx_ref.clone());

        self.await_transfer(&record, &tx_ref, SubmitOutcome::Finalized)
            .await
    }

    /// Wait for a submitted transfer and attach it when finalized
    async fn await_transfer(
        &self,
        record: &CustodyRecord,
        tx_ref: &str,
        outcome: SubmitOutcome,
    ) -> Result<SubmitTransferResponse, AppError> {
        match self
            .ledger_client
            .wait_for_finalization(tx_ref, self.config.finalization_timeout)
            .await
        {
            Ok(receipt) => self.attach_finalized(record, tx_ref, &receipt, outcome).await,
            Err(AppError::Ledger(LedgerError::NotFinalized { .. })) => {
                info!(tx_ref = %tx_ref, "Transfer not finalized yet; call submit again to reconcile");
                Ok(pending_response(record, tx_ref))
            }
            Err(e @ AppError::Ledger(LedgerError::Reverted { .. })) => {
                warn!(tx_ref = %tx_ref, error = %e, "Transfer reverted");
                if let Err(clear_err) = self.db_client.set_pending_tx_ref(&record.id, None).await {
                    error!(error = %clear_err, "Failed to clear reverted transfer reference");
                }
                self.note_failure(&record.id, &e).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Settle a previously submitted attempt; `None` means resubmit
    async fn reconcile_pending(
        &self,
        record: &CustodyRecord,
        pending: &str,
    ) -> Result<Option<SubmitTransferResponse>, AppError> {
        let required = self.ledger_client.required_confirmations();
        match self.ledger_client.get_receipt(pending).await? {
            Some(receipt) if receipt.is_finalized(required) => {
                info!(tx_ref = %pending, "Earlier attempt finalized; attaching");
                self.attach_finalized(record, pending, &receipt, SubmitOutcome::Reconciled)
                    .await
                    .map(Some)
            }
            Some(receipt) if receipt.is_reverted() => {
                info!(tx_ref = %pending, "Earlier attempt reverted; resubmitting");
                self.db_client.set_pending_tx_ref(&record.id, None).await?;
                Ok(None)
            }
            Some(_) => {
                info!(tx_ref = %pending, "Earlier attempt still pending; not resubmitting");
                Ok(Some(pending_response(record, pending)))
            }
            None => {
                // gateways may not have indexed a fresh submission yet
                let unknown_for = (Utc::now() - record.updated_at)
                    .to_std()
                    .unwrap_or_default();
                if unknown_for < self.config.unknown_attempt_grace {
                    info!(tx_ref = %pending, "Earlier attempt not yet known to the ledger; not resubmitting");
                    return Ok(Some(pending_response(record, pending)));
                }
                warn!(tx_ref = %pending, ?unknown_for, "Earlier attempt dropped by the ledger; resubmitting");
                self.db_client.set_pending_tx_ref(&record.id, None).await?;
                Ok(None)
            }
        }
    }

    /// Verify the finalized receipt moved the record's units, then advance
    async fn attach_finalized(
        &self,
        record: &CustodyRecord,
        tx_ref: &str,
        receipt: &TxReceipt,
        outcome: SubmitOutcome,
    ) -> Result<SubmitTransferResponse, AppError> {
        verify_transfer_receipt(record, tx_ref, receipt)?;

        let not_recorded = |observed: String| {
            AppError::inconsistency(
                InconsistencyKind::TransferNotRecorded,
                tx_ref,
                Some(record.id.clone()),
                "custody record sent with finalized tx ref",
                observed,
            )
        };

        match self
            .db_client
            .attach_tx_ref_and_advance(&record.id, tx_ref)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                let current = self.require_record(&record.id).await?;
                if current.tx_ref.as_deref() == Some(tx_ref) {
                    return Ok(submit_response(&current, SubmitOutcome::AlreadyFinalized));
                }
                return Err(not_recorded(format!("record is {}", current.status)));
            }
            Err(e) => {
                error!(tx_ref = %tx_ref, error = %e, "Transfer finalized but record not advanced");
                return Err(not_recorded(e.to_string()));
            }
        }
        info!(record_id = %record.id, tx_ref = %tx_ref, "Custody record sent");

        if let CustodySource::Batch { batch_id } = &record.source {
            if let Err(e) = self.complete_batch_if_transferred(batch_id).await {
                warn!(batch_id = %batch_id, error = %e, "Failed to update batch after transfer");
            }
        }

        Ok(SubmitTransferResponse {
            record_id: record.id.clone(),
            status: CustodyStatus::Sent,
            outcome,
            tx_ref: Some(tx_ref.to_string()),
            pending_tx_ref: None,
        })
    }

    /// Move a batch to `transferred` once every unit left the producer
    async fn complete_batch_if_transferred(&self, batch_id: &str) -> Result<(), AppError> {
        let Some(batch) = self.db_client.get_batch(batch_id).await? else {
            return Ok(());
        };
        if batch.status != BatchStatus::TransferPending {
            return Ok(());
        }

        let source = CustodySource::Batch {
            batch_id: batch_id.to_string(),
        };
        let sent: HashSet<TokenId> = self
            .db_client
            .list_outbound_records(&source)
            .await?
            .into_iter()
            .filter(|r| r.status.has_finalized_transfer())
            .flat_map(|r| r.token_ids)
            .collect();

        if batch.token_ids.iter().all(|id| sent.contains(id)) {
            self.db_client
                .update_batch_status(batch_id, BatchStatus::TransferPending, BatchStatus::Transferred)
                .await?;
            info!(batch_id = %batch_id, "Batch fully transferred");
        }
        Ok(())
    }

    /// Assign token ids to a draft whose assignment did not complete
    async fn resume_token_assignment(
        &self,
        record: CustodyRecord,
    ) -> Result<CustodyRecord, AppError> {
        let lock = self.pool_lock(&record.source);
        let _pool_guard = lock.lock().await;

        let pool = self.source_pool(&record.source).await?;
        let selected = self
            .select_token_ids(&record.source, &pool, record.quantity)
            .await?;
        self.db_client
            .assign_token_ids_once(&record.id, &selected)
            .await?;
        info!(record_id = %record.id, "Token ids assigned on resume");

        // re-read: the stored assignment wins over our selection
        self.require_record(&record.id).await
    }

    async fn note_failure(&self, record_id: &str, err: &AppError) {
        match self
            .db_client
            .record_attempt_failure(record_id, &err.to_string())
            .await
        {
            Ok(attempts) => warn!(record_id = %record_id, attempts, error = %err, "Transfer attempt failed"),
            Err(e) => error!(record_id = %record_id, error = %e, "Failed to record attempt failure"),
        }
    }

    // ------------------------------------------------------------------
    // Status changes after the transfer
    // ------------------------------------------------------------------

    /// Cancel a draft that has no submitted attempt outstanding
    #[instrument(skip(self))]
    pub async fn cancel_transfer(&self, record_id: &str) -> Result<CustodyRecord, AppError> {
        let _guard = self
            .in_flight
            .try_acquire(record_id)
            .ok_or_else(|| AppError::TransferInFlight(record_id.to_string()))?;

        let record = self.require_record(record_id).await?;
        if !record.status.can_transition_to(CustodyStatus::Cancelled) {
            return Err(invalid_record_transition(record.status, CustodyStatus::Cancelled));
        }
        if let Some(pending) = &record.pending_tx_ref {
            return Err(AppError::invalid_field(
                "pending_tx_ref",
                format!("Transfer {pending} was submitted and may still finalize; submit again to reconcile"),
            ));
        }

        self.transition_record(&record, CustodyStatus::Cancelled)
            .await
    }

    /// Mark a sent record received after re-verifying its transfer on the ledger
    #[instrument(skip(self))]
    pub async fn confirm_receipt(&self, record_id: &str) -> Result<CustodyRecord, AppError> {
        let record = self.require_record(record_id).await?;
        if record.status != CustodyStatus::Sent {
            return Err(invalid_record_transition(record.status, CustodyStatus::Received));
        }
        let tx_ref = record.tx_ref.clone().ok_or_else(|| {
            AppError::Invariant(format!("custody record {} is sent without a tx ref", record.id))
        })?;

        let receipt = self.ledger_client.get_receipt(&tx_ref).await?;
        let receipt = match receipt {
            Some(r) if r.is_finalized(self.ledger_client.required_confirmations()) => r,
            other => {
                return Err(AppError::inconsistency(
                    InconsistencyKind::TransferMismatch,
                    tx_ref,
                    Some(record.id.clone()),
                    "finalized transfer",
                    match other {
                        Some(r) => format!("{:?} with {} confirmations", r.status, r.confirmations),
                        None => "transaction unknown to the ledger".to_string(),
                    },
                ));
            }
        };
        verify_transfer_receipt(&record, &tx_ref, &receipt)?;

        self.transition_record(&record, CustodyStatus::Received)
            .await
    }

    /// Business-level advances after receipt: `confirmed`, then `paid`
    #[instrument(skip(self))]
    pub async fn advance_status(
        &self,
        record_id: &str,
        to: CustodyStatus,
    ) -> Result<CustodyRecord, AppError> {
        let record = self.require_record(record_id).await?;
        let allowed = matches!(
            (record.status, to),
            (CustodyStatus::Received, CustodyStatus::Confirmed)
                | (CustodyStatus::Confirmed, CustodyStatus::Paid)
        );
        if !allowed {
            return Err(invalid_record_transition(record.status, to));
        }
        if record.tx_ref.is_none() {
            return Err(AppError::Invariant(format!(
                "custody record {} is {} without a tx ref",
                record.id, record.status
            )));
        }

        self.transition_record(&record, to).await
    }

    async fn transition_record(
        &self,
        record: &CustodyRecord,
        to: CustodyStatus,
    ) -> Result<CustodyRecord, AppError> {
        if !self
            .db_client
            .update_record_status(&record.id, record.status, to)
            .await?
        {
            let current = self.require_record(&record.id).await?;
            return Err(invalid_record_transition(current.status, to));
        }
        info!(record_id = %record.id, from = %record.status, to = %to, "Custody record status changed");
        self.require_record(&record.id).await
    }

    /// Off-ledger batch outcomes: sold, expired, recalled
    #[instrument(skip(self))]
    pub async fn update_batch_status(
        &self,
        batch_id: &str,
        to: BatchStatus,
    ) -> Result<UnitBatch, AppError> {
        if !matches!(
            to,
            BatchStatus::Sold | BatchStatus::Expired | BatchStatus::Recalled
        ) {
            return Err(AppError::invalid_field(
                "status",
                format!("Batch status {to} is set by custody workflows only"),
            ));
        }

        let batch = self.require_batch(batch_id).await?;
        if !batch.status.can_transition_to(to) {
            return Err(invalid_batch_transition(batch.status, to));
        }
        if !self
            .db_client
            .update_batch_status(batch_id, batch.status, to)
            .await?
        {
            let current = self.require_batch(batch_id).await?;
            return Err(invalid_batch_transition(current.status, to));
        }
        info!(batch_id = %batch_id, from = %batch.status, to = %to, "Batch status changed");
        self.require_batch(batch_id).await
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Check a holder's balances without touching any record
    #[instrument(skip(self, request), fields(holder = %request.holder_address))]
    pub async fn check_balances(
        &self,
        request: &CheckBalancesRequest,
    ) -> Result<BalanceCheck, AppError> {
        request
            .validate()
            .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;

        let requirements: Vec<(TokenId, u64)> = match &request.amounts {
            Some(amounts) if amounts.len() != request.token_ids.len() => {
                return Err(AppError::invalid_field(
                    "amounts",
                    "Must contain one amount per token id",
                ));
            }
            Some(amounts) => request
                .token_ids
                .iter()
                .copied()
                .zip(amounts.iter().copied())
                .collect(),
            None => request.token_ids.iter().map(|id| (*id, 1)).collect(),
        };

        self.verifier
            .verify(&request.holder_address, &requirements)
            .await
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<UnitBatch, AppError> {
        self.require_batch(batch_id).await
    }

    pub async fn get_custody_record(&self, record_id: &str) -> Result<CustodyRecord, AppError> {
        self.require_record(record_id).await
    }

    /// Perform health check on all dependencies
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let db_health = match self.db_client.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let ledger_health = match self.ledger_client.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(db_health, ledger_health)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn pool_lock(&self, source: &CustodySource) -> Arc<Mutex<()>> {
        Arc::clone(self.pool_locks.entry(source.pool_key()).or_default().value())
    }

    async fn source_pool(&self, source: &CustodySource) -> Result<SourcePool, AppError> {
        match source {
            CustodySource::Batch { batch_id } => {
                let batch = self.require_batch(batch_id).await?;
                if !matches!(
                    batch.status,
                    BatchStatus::Minted | BatchStatus::TransferPending
                ) {
                    return Err(AppError::invalid_field(
                        "source",
                        format!("Batch {} is {} and has no units to transfer", batch.id, batch.status),
                    ));
                }
                Ok(SourcePool {
                    address: batch.producer_address,
                    role: PartyRole::Producer,
                    token_ids: batch.token_ids,
                    batch_status: Some(batch.status),
                })
            }
            CustodySource::Record { record_id } => {
                let upstream = self.require_record(record_id).await?;
                if !upstream.status.custody_received() {
                    return Err(AppError::invalid_field(
                        "source",
                        format!(
                            "Custody record {} is {}; units must be received before passing them on",
                            upstream.id, upstream.status
                        ),
                    ));
                }
                Ok(SourcePool {
                    address: upstream.destination_address,
                    role: upstream.destination_role,
                    token_ids: upstream.token_ids,
                    batch_status: None,
                })
            }
        }
    }

    async fn source_role(&self, source: &CustodySource) -> Result<PartyRole, AppError> {
        match source {
            CustodySource::Batch { .. } => Ok(PartyRole::Producer),
            CustodySource::Record { record_id } => {
                Ok(self.require_record(record_id).await?.destination_role)
            }
        }
    }

    /// Lowest unallocated ids of the pool; caller holds the pool lock
    async fn select_token_ids(
        &self,
        source: &CustodySource,
        pool: &SourcePool,
        quantity: u32,
    ) -> Result<Vec<TokenId>, AppError> {
        let allocated: HashSet<TokenId> = self
            .db_client
            .list_outbound_records(source)
            .await?
            .into_iter()
            .filter(|r| r.status != CustodyStatus::Cancelled)
            .flat_map(|r| r.token_ids)
            .collect();

        let mut available: Vec<TokenId> = pool
            .token_ids
            .iter()
            .copied()
            .filter(|id| !allocated.contains(id))
            .collect();
        available.sort_unstable();

        let quantity = quantity as usize;
        if available.len() < quantity {
            return Err(AppError::invalid_field(
                "quantity",
                format!(
                    "Requested {} units but only {} are available from {} ({})",
                    quantity,
                    available.len(),
                    source.pool_key(),
                    pool.role
                ),
            ));
        }
        available.truncate(quantity);
        Ok(available)
    }

    async fn require_record(&self, record_id: &str) -> Result<CustodyRecord, AppError> {
        self.db_client
            .get_custody_record(record_id)
            .await?
            .ok_or_else(|| AppError::not_found("Custody record", record_id))
    }

    async fn require_batch(&self, batch_id: &str) -> Result<UnitBatch, AppError> {
        self.db_client
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| AppError::not_found("Batch", batch_id))
    }
}

fn validate_mint_request(request: &MintBatchRequest) -> Result<(), AppError> {
    request
        .validate()
        .map_err(|e| AppError::Validation(ValidationError::Multiple(e.to_string())))?;
    if request.expiry_date <= request.production_date {
        return Err(AppError::invalid_field(
            "expiry_date",
            "Expiry date must be after the production date",
        ));
    }
    Ok(())
}

/// The receipt must move exactly the record's ids from source to destination
fn verify_transfer_receipt(
    record: &CustodyRecord,
    tx_ref: &str,
    receipt: &TxReceipt,
) -> Result<(), AppError> {
    let moved = receipt.transferred_ids(&record.source_address, &record.destination_address);
    let mut expected = record.token_ids.clone();
    expected.sort_unstable();
    if moved != expected {
        error!(tx_ref = %tx_ref, record_id = %record.id, "Finalized transfer does not match record");
        return Err(AppError::inconsistency(
            InconsistencyKind::TransferMismatch,
            tx_ref,
            Some(record.id.clone()),
            format!("{:?}", expected),
            format!("{:?}", moved),
        ));
    }
    Ok(())
}

fn submit_response(record: &CustodyRecord, outcome: SubmitOutcome) -> SubmitTransferResponse {
    SubmitTransferResponse {
        record_id: record.id.clone(),
        status: record.status,
        outcome,
        tx_ref: record.tx_ref.clone(),
        pending_tx_ref: record.pending_tx_ref.clone(),
    }
}

fn pending_response(record: &CustodyRecord, tx_ref: &str) -> SubmitTransferResponse {
    SubmitTransferResponse {
        record_id: record.id.clone(),
        status: CustodyStatus::Draft,
        outcome: SubmitOutcome::Pending,
        tx_ref: None,
        pending_tx_ref: Some(tx_ref.to_string()),
    }
}

fn invalid_record_transition(from: CustodyStatus, to: CustodyStatus) -> AppError {
    AppError::Validation(ValidationError::InvalidTransition {
        entity: "custody record",
        from: from.to_string(),
        to: to.to_string(),
    })
}

fn invalid_batch_transition(from: BatchStatus, to: BatchStatus) -> AppError {
    AppError::Validation(ValidationError::InvalidTransition {
        entity: "batch",
        from: from.to_string(),
        to: to.to_string(),
    })
}
