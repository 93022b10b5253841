//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AppError, BatchStatus, CustodyRecord, CustodySource, CustodyStatus, DatabaseClient,
    DatabaseError, LedgerClient, LedgerError, LedgerEvent, NULL_ADDRESS, NewCustodyRecord,
    NewUnitBatch, PartyRole, ReceiptStatus, Signer, TokenId, TransferCall, TxReceipt, UnitBatch,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// Deterministic signer for tests
#[must_use]
pub fn test_signer(seed: u8) -> Signer {
    Signer::new(SigningKey::from_bytes(&[seed; 32]))
}

// ============================================================================
// Off-chain store
// ============================================================================

/// In-memory store mirroring the guarded updates of the Postgres client
pub struct MockDatabaseClient {
    batches: Arc<Mutex<HashMap<String, UnitBatch>>>,
    records: Arc<Mutex<HashMap<String, CustodyRecord>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    failing_operations: Mutex<HashSet<&'static str>>,
}

impl MockDatabaseClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            batches: Arc::new(Mutex::new(HashMap::new())),
            records: Arc::new(Mutex::new(HashMap::new())),
            config,
            is_healthy: AtomicBool::new(true),
            failing_operations: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Make one trait method fail until restored, e.g. `"create_batch"`
    pub fn fail_operation(&self, operation: &'static str) {
        self.failing_operations.lock().unwrap().insert(operation);
    }

    pub fn restore_operation(&self, operation: &'static str) {
        self.failing_operations.lock().unwrap().remove(operation);
    }

    pub fn get_all_batches(&self) -> Vec<UnitBatch> {
        self.batches.lock().unwrap().values().cloned().collect()
    }

    pub fn get_all_records(&self) -> Vec<CustodyRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    /// Overwrite a record as stored (for test setup)
    pub fn put_record(&self, record: CustodyRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    fn check(&self, operation: &'static str) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(self.config.message())));
        }
        if self.failing_operations.lock().unwrap().contains(operation) {
            return Err(AppError::Database(DatabaseError::Connection(format!(
                "{} unavailable",
                operation
            ))));
        }
        Ok(())
    }
}

impl Default for MockDatabaseClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseClient for MockDatabaseClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check("health_check")
    }

    async fn create_batch(&self, batch: &NewUnitBatch) -> Result<UnitBatch, AppError> {
        self.check("create_batch")?;
        let mut batches = self.batches.lock().unwrap();
        if batches.values().any(|b| b.mint_tx_ref == batch.mint_tx_ref) {
            return Err(AppError::Database(DatabaseError::Duplicate(format!(
                "mint_tx_ref {}",
                batch.mint_tx_ref
            ))));
        }
        let now = Utc::now();
        let created = UnitBatch {
            id: Uuid::now_v7().to_string(),
            producer_address: batch.producer_address.clone(),
            product_ref: batch.product_ref.clone(),
            quantity: batch.quantity,
            production_date: batch.production_date,
            expiry_date: batch.expiry_date,
            metadata_ref: batch.metadata_ref.clone(),
            token_ids: batch.token_ids.clone(),
            mint_tx_ref: batch.mint_tx_ref.clone(),
            status: BatchStatus::Minted,
            created_at: now,
            updated_at: now,
        };
        batches.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get_batch(&self, id: &str) -> Result<Option<UnitBatch>, AppError> {
        self.check("get_batch")?;
        Ok(self.batches.lock().unwrap().get(id).cloned())
    }

    async fn get_batch_by_mint_tx(&self, tx_ref: &str) -> Result<Option<UnitBatch>, AppError> {
        self.check("get_batch_by_mint_tx")?;
        Ok(self
            .batches
            .lock()
            .unwrap()
            .values()
            .find(|b| b.mint_tx_ref == tx_ref)
            .cloned())
    }

    async fn update_batch_status(
        &self,
        id: &str,
        from: BatchStatus,
        to: BatchStatus,
    ) -> Result<bool, AppError> {
        self.check("update_batch_status")?;
        let mut batches = self.batches.lock().unwrap();
        match batches.get_mut(id) {
            Some(batch) if batch.status == from => {
                batch.status = to;
                batch.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_custody_record(
        &self,
        record: &NewCustodyRecord,
    ) -> Result<CustodyRecord, AppError> {
        self.check("create_custody_record")?;
        let now = Utc::now();
        let created = CustodyRecord {
            id: Uuid::now_v7().to_string(),
            source: record.source.clone(),
            source_address: record.source_address.clone(),
            destination_address: record.destination_address.clone(),
            destination_role: record.destination_role,
            quantity: record.quantity,
            token_ids: Vec::new(),
            tx_ref: None,
            pending_tx_ref: None,
            status: CustodyStatus::Draft,
            attempt_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.records
            .lock()
            .unwrap()
            .insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn get_custody_record(&self, id: &str) -> Result<Option<CustodyRecord>, AppError> {
        self.check("get_custody_record")?;
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn assign_token_ids_once(
        &self,
        id: &str,
        token_ids: &[TokenId],
    ) -> Result<bool, AppError> {
        self.check("assign_token_ids_once")?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(id) {
            Some(record)
                if record.status == CustodyStatus::Draft
                    && record.token_ids.is_empty()
                    && token_ids.len() == record.quantity as usize =>
            {
                record.token_ids = token_ids.to_vec();
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_pending_tx_ref(&self, id: &str, tx_ref: Option<&str>) -> Result<(), AppError> {
        self.check("set_pending_tx_ref")?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(id) {
            Some(record) if record.status == CustodyStatus::Draft => {
                record.pending_tx_ref = tx_ref.map(str::to_string);
                record.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(AppError::not_found("Draft custody record", id)),
        }
    }

    async fn attach_tx_ref_and_advance(&self, id: &str, tx_ref: &str) -> Result<bool, AppError> {
        self.check("attach_tx_ref_and_advance")?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(id) {
            Some(record)
                if record.status == CustodyStatus::Draft
                    && record.tx_ref.is_none()
                    && record.token_ids.len() == record.quantity as usize =>
            {
                record.tx_ref = Some(tx_ref.to_string());
                record.pending_tx_ref = None;
                record.status = CustodyStatus::Sent;
                record.last_error = None;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_attempt_failure(&self, id: &str, error: &str) -> Result<i32, AppError> {
        self.check("record_attempt_failure")?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| AppError::not_found("Custody record", id))?;
        record.attempt_count += 1;
        record.last_error = Some(error.to_string());
        record.updated_at = Utc::now();
        Ok(record.attempt_count)
    }

    async fn update_record_status(
        &self,
        id: &str,
        from: CustodyStatus,
        to: CustodyStatus,
    ) -> Result<bool, AppError> {
        self.check("update_record_status")?;
        let mut records = self.records.lock().unwrap();
        match records.get_mut(id) {
            Some(record)
                if record.status == from
                    && (record.tx_ref.is_some()
                        || matches!(to, CustodyStatus::Draft | CustodyStatus::Cancelled)) =>
            {
                record.status = to;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_outbound_records(
        &self,
        source: &CustodySource,
    ) -> Result<Vec<CustodyRecord>, AppError> {
        self.check("list_outbound_records")?;
        let mut records: Vec<CustodyRecord> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| &r.source == source)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }
}

// ============================================================================
// Token ledger
// ============================================================================

/// How the mock reports the ids of a mint in its receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MintEventMode {
    /// Dedicated mint event with every id
    #[default]
    MintedEvent,
    /// Only a transfer from the null address
    NullSenderTransfer,
    /// Mint event missing the last `n` ids
    DropLast(usize),
    /// No events at all
    NoEvents,
}

#[derive(Debug)]
struct LedgerState {
    balances: HashMap<(String, TokenId), u128>,
    roles: HashSet<(String, PartyRole)>,
    receipts: HashMap<String, TxReceipt>,
    held: HashMap<String, TransferCall>,
    transfers: Vec<TransferCall>,
    mints: usize,
    next_token_id: TokenId,
    tx_counter: u64,
    mint_event_mode: MintEventMode,
    hold_transfers: bool,
    transfer_rejection: Option<String>,
    transfer_revert: Option<String>,
    deployed: bool,
    transfer_delay: Duration,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            balances: HashMap::new(),
            roles: HashSet::new(),
            receipts: HashMap::new(),
            held: HashMap::new(),
            transfers: Vec::new(),
            mints: 0,
            next_token_id: 1,
            tx_counter: 0,
            mint_event_mode: MintEventMode::default(),
            hold_transfers: false,
            transfer_rejection: None,
            transfer_revert: None,
            deployed: true,
            transfer_delay: Duration::ZERO,
        }
    }
}

impl LedgerState {
    fn next_tx_ref(&mut self, kind: &str) -> String {
        self.tx_counter += 1;
        format!("0x{}{:04}", kind, self.tx_counter)
    }

    fn receipt(&self, tx_ref: &str, status: ReceiptStatus, confirmations: u64) -> TxReceipt {
        TxReceipt {
            tx_ref: tx_ref.to_string(),
            status,
            block_number: Some(self.tx_counter),
            confirmations,
            revert_reason: None,
            events: Vec::new(),
        }
    }

    /// Execute a transfer the way the contract would, reverting on shortfall
    fn execute_transfer(&mut self, tx_ref: &str, call: &TransferCall, confirmations: u64) {
        let short = call
            .token_ids
            .iter()
            .zip(call.amounts.iter())
            .any(|(id, amount)| {
                self.balances
                    .get(&(call.from.clone(), *id))
                    .copied()
                    .unwrap_or(0)
                    < u128::from(*amount)
            });

        let mut receipt = self.receipt(tx_ref, ReceiptStatus::Success, confirmations);
        if short {
            receipt.status = ReceiptStatus::Reverted;
            receipt.revert_reason = Some("insufficient balance for transfer".to_string());
            self.receipts.insert(tx_ref.to_string(), receipt);
            return;
        }

        for (id, amount) in call.token_ids.iter().zip(call.amounts.iter()) {
            let amount = u128::from(*amount);
            if let Some(held) = self.balances.get_mut(&(call.from.clone(), *id)) {
                *held -= amount;
            }
            *self.balances.entry((call.to.clone(), *id)).or_default() += amount;
        }

        receipt.events = vec![if call.is_single() {
            LedgerEvent::TransferSingle {
                operator: call.from.clone(),
                from: call.from.clone(),
                to: call.to.clone(),
                id: call.token_ids[0],
                value: call.amounts[0],
            }
        } else {
            LedgerEvent::TransferBatch {
                operator: call.from.clone(),
                from: call.from.clone(),
                to: call.to.clone(),
                ids: call.token_ids.clone(),
                values: call.amounts.clone(),
            }
        }];
        self.receipts.insert(tx_ref.to_string(), receipt);
    }
}

/// In-memory token ledger with sequential token ids and instant finality
pub struct MockLedgerClient {
    state: Mutex<LedgerState>,
    config: MockConfig,
    is_healthy: AtomicBool,
    required_confirmations: u64,
}

impl MockLedgerClient {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            config,
            is_healthy: AtomicBool::new(true),
            required_confirmations: 1,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_balance(&self, address: &str, token_id: TokenId, amount: u128) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert((address.to_string(), token_id), amount);
    }

    pub fn balance(&self, address: &str, token_id: TokenId) -> u128 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(&(address.to_string(), token_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn grant_role(&self, address: &str, role: PartyRole) {
        self.state
            .lock()
            .unwrap()
            .roles
            .insert((address.to_string(), role));
    }

    pub fn set_deployed(&self, deployed: bool) {
        self.state.lock().unwrap().deployed = deployed;
    }

    pub fn set_next_token_id(&self, token_id: TokenId) {
        self.state.lock().unwrap().next_token_id = token_id;
    }

    pub fn set_mint_event_mode(&self, mode: MintEventMode) {
        self.state.lock().unwrap().mint_event_mode = mode;
    }

    /// Leave new transfers pending until finalized or reverted by the test
    pub fn hold_transfers(&self, hold: bool) {
        self.state.lock().unwrap().hold_transfers = hold;
    }

    /// Reject transfers before broadcast, as a declining signer would
    pub fn reject_transfers(&self, reason: Option<&str>) {
        self.state.lock().unwrap().transfer_rejection = reason.map(str::to_string);
    }

    /// Broadcast transfers but have the ledger revert them
    pub fn revert_transfers(&self, reason: Option<&str>) {
        self.state.lock().unwrap().transfer_revert = reason.map(str::to_string);
    }

    /// Delay every transfer submission
    pub fn set_transfer_delay(&self, delay: Duration) {
        self.state.lock().unwrap().transfer_delay = delay;
    }

    /// Execute a held transfer
    pub fn finalize_held(&self, tx_ref: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(call) = state.held.remove(tx_ref) {
            state.execute_transfer(tx_ref, &call, self.required_confirmations);
        }
    }

    /// Revert a held transfer without moving anything
    pub fn revert_held(&self, tx_ref: &str) {
        let mut state = self.state.lock().unwrap();
        if state.held.remove(tx_ref).is_some() {
            let mut receipt =
                state.receipt(tx_ref, ReceiptStatus::Reverted, self.required_confirmations);
            receipt.revert_reason = Some("nonce too low".to_string());
            state.receipts.insert(tx_ref.to_string(), receipt);
        }
    }

    /// Drop a held transfer as if it never reached the ledger
    pub fn forget_held(&self, tx_ref: &str) {
        let mut state = self.state.lock().unwrap();
        state.held.remove(tx_ref);
        state.receipts.remove(tx_ref);
    }

    pub fn set_receipt(&self, receipt: TxReceipt) {
        self.state
            .lock()
            .unwrap()
            .receipts
            .insert(receipt.tx_ref.clone(), receipt);
    }

    pub fn receipt(&self, tx_ref: &str) -> Option<TxReceipt> {
        self.state.lock().unwrap().receipts.get(tx_ref).cloned()
    }

    /// Every transfer submitted, in order
    pub fn transfer_calls(&self) -> Vec<TransferCall> {
        self.state.lock().unwrap().transfers.clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.state.lock().unwrap().transfers.len()
    }

    pub fn mint_count(&self) -> usize {
        self.state.lock().unwrap().mints
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Ledger(LedgerError::Connection {
                endpoint: "mock://ledger".to_string(),
                message: self.config.message(),
            }));
        }
        Ok(())
    }

    fn preflight(&self, state: &LedgerState, signer: &Signer, role: PartyRole) -> Result<(), AppError> {
        if !state.deployed {
            return Err(AppError::Ledger(LedgerError::ContractNotDeployed {
                address: "mock-contract".to_string(),
                endpoint: "mock://ledger".to_string(),
            }));
        }
        if !state.roles.contains(&(signer.address().to_string(), role)) {
            return Err(AppError::Ledger(LedgerError::MissingRole {
                address: signer.address().to_string(),
                role: role.ledger_role().to_string(),
            }));
        }
        Ok(())
    }
}

impl Default for MockLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Ledger(LedgerError::Connection {
                endpoint: "mock://ledger".to_string(),
                message: "Unhealthy".to_string(),
            }));
        }
        self.check_should_fail()
    }

    async fn chain_id(&self) -> Result<String, AppError> {
        self.check_should_fail()?;
        Ok("custody-devnet".to_string())
    }

    async fn is_deployed(&self, _address: &str) -> Result<bool, AppError> {
        self.check_should_fail()?;
        Ok(self.state.lock().unwrap().deployed)
    }

    async fn has_role(&self, address: &str, role: PartyRole) -> Result<bool, AppError> {
        self.check_should_fail()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .roles
            .contains(&(address.to_string(), role)))
    }

    async fn balance_of(&self, address: &str, token_id: TokenId) -> Result<u128, AppError> {
        self.check_should_fail()?;
        Ok(self.balance(address, token_id))
    }

    async fn mint(
        &self,
        signer: &Signer,
        quantity: u32,
        _metadata_ref: &str,
    ) -> Result<String, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        self.preflight(&state, signer, PartyRole::Producer)?;

        let first = state.next_token_id;
        let ids: Vec<TokenId> = (first..first + u64::from(quantity)).collect();
        state.next_token_id = first + u64::from(quantity);
        for id in &ids {
            *state
                .balances
                .entry((signer.address().to_string(), *id))
                .or_default() += 1;
        }

        let to = signer.address().to_string();
        let events = match state.mint_event_mode {
            MintEventMode::MintedEvent => vec![LedgerEvent::UnitsMinted {
                to,
                token_ids: ids,
            }],
            MintEventMode::NullSenderTransfer => vec![LedgerEvent::TransferBatch {
                operator: to.clone(),
                from: NULL_ADDRESS.to_string(),
                to,
                values: vec![1; ids.len()],
                ids,
            }],
            MintEventMode::DropLast(n) => {
                let keep = ids.len().saturating_sub(n);
                vec![LedgerEvent::UnitsMinted {
                    to,
                    token_ids: ids[..keep].to_vec(),
                }]
            }
            MintEventMode::NoEvents => Vec::new(),
        };

        let tx_ref = state.next_tx_ref("mint");
        let mut receipt = state.receipt(&tx_ref, ReceiptStatus::Success, self.required_confirmations);
        receipt.events = events;
        state.receipts.insert(tx_ref.clone(), receipt);
        state.mints += 1;
        Ok(tx_ref)
    }

    async fn transfer(
        &self,
        signer: &Signer,
        call: &TransferCall,
        from_role: PartyRole,
    ) -> Result<String, AppError> {
        let delay = self.state.lock().unwrap().transfer_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_should_fail()?;

        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.transfer_rejection {
            return Err(AppError::Ledger(LedgerError::SignerRejected(reason.clone())));
        }
        if signer.address() != call.from {
            return Err(AppError::Authorization(format!(
                "Signer {} cannot move units held by {}",
                signer.address(),
                call.from
            )));
        }
        self.preflight(&state, signer, from_role)?;

        let tx_ref = state.next_tx_ref("transfer");
        state.transfers.push(call.clone());
        if let Some(reason) = state.transfer_revert.clone() {
            let mut receipt =
                state.receipt(&tx_ref, ReceiptStatus::Reverted, self.required_confirmations);
            receipt.revert_reason = Some(reason);
            state.receipts.insert(tx_ref.clone(), receipt);
        } else if state.hold_transfers {
            let receipt = state.receipt(&tx_ref, ReceiptStatus::Pending, 0);
            state.receipts.insert(tx_ref.clone(), receipt);
            state.held.insert(tx_ref.clone(), call.clone());
        } else {
            state.execute_transfer(&tx_ref, call, self.required_confirmations);
        }
        Ok(tx_ref)
    }

    async fn get_receipt(&self, tx_ref: &str) -> Result<Option<TxReceipt>, AppError> {
        self.check_should_fail()?;
        Ok(self.state.lock().unwrap().receipts.get(tx_ref).cloned())
    }

    fn required_confirmations(&self) -> u64 {
        self.required_confirmations
    }
}
