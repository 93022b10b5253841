//! Domain types with validation support.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::ledger::TokenId;

/// Off-chain status of a production batch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Tokens minted and ids recorded
    #[default]
    Minted,
    /// At least one outbound custody record exists
    TransferPending,
    /// Every unit of the batch has left the producer on the ledger
    Transferred,
    Sold,
    Expired,
    Recalled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minted => "minted",
            Self::TransferPending => "transfer_pending",
            Self::Transferred => "transferred",
            Self::Sold => "sold",
            Self::Expired => "expired",
            Self::Recalled => "recalled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sold | Self::Expired | Self::Recalled)
    }

    /// Whether `next` is a legal successor of this status
    #[must_use]
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        match (self, next) {
            (Self::Minted, Self::TransferPending)
            | (Self::TransferPending, Self::Transferred)
            | (Self::Transferred, Self::Sold) => true,
            (current, Self::Expired | Self::Recalled) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minted" => Ok(Self::Minted),
            "transfer_pending" => Ok(Self::TransferPending),
            "transferred" => Ok(Self::Transferred),
            "sold" => Ok(Self::Sold),
            "expired" => Ok(Self::Expired),
            "recalled" => Ok(Self::Recalled),
            _ => Err(format!("Invalid batch status: {}", s)),
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a custody record (invoice / distribution confirmation)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CustodyStatus {
    /// Durable intent; token ids assigned, no finalized ledger transfer yet
    #[default]
    Draft,
    /// Finalized ledger transfer attached
    Sent,
    /// Receipt verified against the ledger by the destination
    Received,
    Confirmed,
    Paid,
    Cancelled,
}

impl CustodyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Confirmed => "confirmed",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether `next` is a legal successor of this status
    #[must_use]
    pub fn can_transition_to(&self, next: CustodyStatus) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Sent)
                | (Self::Draft, Self::Cancelled)
                | (Self::Sent, Self::Received)
                | (Self::Received, Self::Confirmed)
                | (Self::Confirmed, Self::Paid)
        )
    }

    /// A finalized ledger transfer is attached in every one of these states
    #[must_use]
    pub fn has_finalized_transfer(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Received | Self::Confirmed | Self::Paid
        )
    }

    /// The destination holds the units and may pass them on
    #[must_use]
    pub fn custody_received(&self) -> bool {
        matches!(self, Self::Received | Self::Confirmed | Self::Paid)
    }
}

impl std::str::FromStr for CustodyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "sent" => Ok(Self::Sent),
            "received" => Ok(Self::Received),
            "confirmed" => Ok(Self::Confirmed),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid custody status: {}", s)),
        }
    }
}

impl std::fmt::Display for CustodyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a party holds in the custody chain, mirrored by a ledger role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PartyRole {
    Producer,
    Distributor,
    RetailOutlet,
}

impl PartyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Distributor => "distributor",
            Self::RetailOutlet => "retail_outlet",
        }
    }

    /// Role identifier enforced by the token contract
    pub fn ledger_role(&self) -> &'static str {
        match self {
            Self::Producer => "PRODUCER_ROLE",
            Self::Distributor => "DISTRIBUTOR_ROLE",
            Self::RetailOutlet => "RETAILER_ROLE",
        }
    }
}

impl std::str::FromStr for PartyRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "producer" => Ok(Self::Producer),
            "distributor" => Ok(Self::Distributor),
            "retail_outlet" => Ok(Self::RetailOutlet),
            _ => Err(format!("Invalid party role: {}", s)),
        }
    }
}

impl std::fmt::Display for PartyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the units of a custody record come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustodySource {
    /// Straight from a producer's minted batch
    Batch { batch_id: String },
    /// Passed on from units received in an upstream custody record
    Record { record_id: String },
}

impl CustodySource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch { .. } => "batch",
            Self::Record { .. } => "record",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Batch { batch_id } => batch_id,
            Self::Record { record_id } => record_id,
        }
    }

    /// Rebuild from the persisted `(kind, id)` pair
    pub fn from_parts(kind: &str, id: String) -> Result<Self, String> {
        match kind {
            "batch" => Ok(Self::Batch { batch_id: id }),
            "record" => Ok(Self::Record { record_id: id }),
            _ => Err(format!("Invalid custody source kind: {}", kind)),
        }
    }

    /// Stable key used to serialize allocation from the same pool
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.kind(), self.id())
    }
}

/// A production run and its minted unit tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct UnitBatch {
    #[schema(example = "0192a4c1-7e7c-7d3e-8f1a-2b3c4d5e6f70")]
    pub id: String,
    pub producer_address: String,
    #[schema(example = "AMOX-500-CAPS")]
    pub product_ref: String,
    pub quantity: u32,
    pub production_date: NaiveDate,
    pub expiry_date: NaiveDate,
    /// Reference into the content-addressed metadata store
    #[schema(example = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi")]
    pub metadata_ref: String,
    /// Ascending, one per physical unit
    pub token_ids: Vec<TokenId>,
    pub mint_tx_ref: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch data handed to the store once token ids are resolved
#[derive(Debug, Clone, PartialEq)]
pub struct NewUnitBatch {
    pub producer_address: String,
    pub product_ref: String,
    pub quantity: u32,
    pub production_date: NaiveDate,
    pub expiry_date: NaiveDate,
    pub metadata_ref: String,
    pub token_ids: Vec<TokenId>,
    pub mint_tx_ref: String,
}

/// An intended or completed custody transfer between two parties
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CustodyRecord {
    pub id: String,
    pub source: CustodySource,
    pub source_address: String,
    pub destination_address: String,
    pub destination_role: PartyRole,
    pub quantity: u32,
    /// Assigned at most once; length equals `quantity` once assigned
    pub token_ids: Vec<TokenId>,
    /// Finalized ledger transfer; always set from `sent` onwards
    pub tx_ref: Option<String>,
    /// Submitted attempt whose finalization has not been observed yet
    pub pending_tx_ref: Option<String>,
    pub status: CustodyStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustodyRecord {
    #[must_use]
    pub fn has_token_ids(&self) -> bool {
        !self.token_ids.is_empty()
    }
}

/// Custody record data handed to the store on creation
#[derive(Debug, Clone, PartialEq)]
pub struct NewCustodyRecord {
    pub source: CustodySource,
    pub source_address: String,
    pub destination_address: String,
    pub destination_role: PartyRole,
    pub quantity: u32,
}

/// Request to mint a production batch
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct MintBatchRequest {
    /// Ledger address of the producer; must match a configured signer
    #[validate(length(min = 1, message = "Producer address is required"))]
    pub producer_address: String,
    #[validate(length(min = 1, max = 128, message = "Product reference must be 1-128 characters"))]
    pub product_ref: String,
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: u32,
    pub production_date: NaiveDate,
    pub expiry_date: NaiveDate,
    #[validate(length(min = 1, message = "Metadata reference is required"))]
    pub metadata_ref: String,
}

impl MintBatchRequest {
    #[must_use]
    pub fn to_new_batch(&self, token_ids: Vec<TokenId>, mint_tx_ref: &str) -> NewUnitBatch {
        NewUnitBatch {
            producer_address: self.producer_address.clone(),
            product_ref: self.product_ref.clone(),
            quantity: self.quantity,
            production_date: self.production_date,
            expiry_date: self.expiry_date,
            metadata_ref: self.metadata_ref.clone(),
            token_ids,
            mint_tx_ref: mint_tx_ref.to_string(),
        }
    }
}

/// Result of a completed mint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct MintBatchResponse {
    pub batch_id: String,
    pub token_ids: Vec<TokenId>,
    pub tx_ref: String,
}

impl From<&UnitBatch> for MintBatchResponse {
    fn from(batch: &UnitBatch) -> Self {
        Self {
            batch_id: batch.id.clone(),
            token_ids: batch.token_ids.clone(),
            tx_ref: batch.mint_tx_ref.clone(),
        }
    }
}

/// Re-run the tail of a mint whose ledger transaction already finalized
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct RecoverMintRequest {
    #[validate(length(min = 1, message = "Transaction reference is required"))]
    pub tx_ref: String,
    #[validate(nested)]
    pub batch: MintBatchRequest,
}

/// Request to create a draft custody transfer
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateTransferRequest {
    pub source: CustodySource,
    #[validate(length(min = 1, message = "Destination address is required"))]
    pub destination_address: String,
    pub destination_role: PartyRole,
    #[validate(range(min = 1, max = 10000, message = "Quantity must be between 1 and 10000"))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct CreateTransferResponse {
    pub record_id: String,
    pub status: CustodyStatus,
    pub selected_token_ids: Vec<TokenId>,
}

/// How a submit call concluded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// This call submitted the transfer and observed finalization
    Finalized,
    /// A previous attempt had already finalized; nothing was submitted
    AlreadyFinalized,
    /// An earlier submitted attempt was found finalized and attached
    Reconciled,
    /// Submitted but finalization not yet observed; call again later
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct SubmitTransferResponse {
    pub record_id: String,
    pub status: CustodyStatus,
    pub outcome: SubmitOutcome,
    pub tx_ref: Option<String>,
    pub pending_tx_ref: Option<String>,
}

/// Request to verify a holder's balances before a transfer
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CheckBalancesRequest {
    #[validate(length(min = 1, message = "Holder address is required"))]
    pub holder_address: String,
    #[validate(length(min = 1, max = 10000, message = "Between 1 and 10000 token ids required"))]
    pub token_ids: Vec<TokenId>,
    /// Needed amount per token id; one unit each when omitted
    #[serde(default)]
    pub amounts: Option<Vec<u64>>,
}

/// A token the holder does not hold enough of
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Shortfall {
    pub token_id: TokenId,
    #[schema(example = "0")]
    pub held: String,
    #[schema(example = "1")]
    pub needed: String,
}

/// Outcome of a balance verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct BalanceCheck {
    pub can_transfer: bool,
    pub shortfalls: Vec<Shortfall>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateBatchStatusRequest {
    pub status: BatchStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UpdateRecordStatusRequest {
    pub status: CustodyStatus,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub ledger: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, ledger: HealthStatus) -> Self {
        let status = match (&database, &ledger) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            ledger,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    #[schema(example = "validation_error")]
    pub r#type: String,
    /// Retry taxonomy bucket
    #[schema(example = "rejected_before_submission")]
    pub category: String,
    pub message: String,
    /// Shortfalls or reconciliation data, when relevant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}
