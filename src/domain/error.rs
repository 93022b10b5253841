//! Error types shared across layers.
//!
//! Every error maps onto an [`ErrorCategory`] so callers can tell a clean
//! pre-submission rejection apart from a transport problem, an on-chain revert
//! or a disagreement between the two ledgers.

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use super::types::Shortfall;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Transfer already in flight for custody record {0}")]
    TransferInFlight(String),

    #[error("Insufficient ledger balance for custody record {record_id}")]
    InsufficientBalance {
        record_id: String,
        shortfalls: Vec<Shortfall>,
    },

    #[error("Recoverable inconsistency: {0}")]
    Inconsistency(Box<Inconsistency>),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Off-chain store errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Duplicate(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

/// Token ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger endpoint {endpoint} unreachable: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Ledger request timed out: {0}")]
    Timeout(String),

    #[error("Ledger RPC error: {0}")]
    RpcError(String),

    #[error("Ledger endpoint {endpoint} is on network '{actual}', expected '{expected}'")]
    WrongNetwork {
        endpoint: String,
        expected: String,
        actual: String,
    },

    #[error("No token contract deployed at {address} on {endpoint}")]
    ContractNotDeployed { address: String, endpoint: String },

    #[error("Address {address} does not hold the {role} role")]
    MissingRole { address: String, role: String },

    #[error("Transaction {tx_ref} reverted: {reason}")]
    Reverted { tx_ref: String, reason: String },

    #[error("Submission rejected before broadcast: {0}")]
    SignerRejected(String),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Transaction {tx_ref} not finalized within {timeout_secs}s")]
    NotFinalized { tx_ref: String, timeout_secs: u64 },
}

/// Request validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Multiple(String),

    #[error("Invalid {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid {entity} status transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration: {0}")]
    Missing(String),

    #[error("Invalid configuration for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Which reconciliation step found the two ledgers disagreeing
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyKind {
    /// Mint finalized (or may have), but token ids could not be resolved
    MintUnresolved,
    /// Mint resolved, but the batch could not be persisted
    MintNotRecorded,
    /// Transfer finalized, but the custody record could not be advanced
    TransferNotRecorded,
    /// Finalized receipt does not move the recorded token ids
    TransferMismatch,
}

/// Details needed to reconcile an off-chain/on-chain disagreement
#[derive(Debug, Clone, Serialize, PartialEq, Eq, ToSchema)]
pub struct Inconsistency {
    pub kind: InconsistencyKind,
    /// Ledger transaction the disagreement is anchored on
    pub tx_ref: String,
    /// Batch or custody record id, when one exists
    pub subject_id: Option<String>,
    pub expected: String,
    pub observed: String,
}

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} for tx {}: expected {}, observed {}",
            self.kind, self.tx_ref, self.expected, self.observed
        )
    }
}

impl AppError {
    #[must_use]
    pub fn inconsistency(
        kind: InconsistencyKind,
        tx_ref: impl Into<String>,
        subject_id: Option<String>,
        expected: impl Into<String>,
        observed: impl Into<String>,
    ) -> Self {
        Self::Inconsistency(Box::new(Inconsistency {
            kind,
            tx_ref: tx_ref.into(),
            subject_id,
            expected: expected.into(),
            observed: observed.into(),
        }))
    }

    /// Classify the error for callers deciding whether and how to retry
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::Authorization(_) | Self::InsufficientBalance { .. } => {
                ErrorCategory::RejectedBeforeSubmission
            }
            Self::Ledger(err) => match err {
                LedgerError::SignerRejected(_)
                | LedgerError::MissingRole { .. }
                | LedgerError::InvalidKey(_) => ErrorCategory::RejectedBeforeSubmission,
                LedgerError::Reverted { .. } => ErrorCategory::Reverted,
                LedgerError::Connection { .. }
                | LedgerError::Timeout(_)
                | LedgerError::RpcError(_)
                | LedgerError::WrongNetwork { .. }
                | LedgerError::ContractNotDeployed { .. }
                | LedgerError::NotFinalized { .. } => ErrorCategory::Transport,
            },
            Self::Database(err) => match err {
                DatabaseError::NotFound(_) => ErrorCategory::NotFound,
                DatabaseError::Duplicate(_) => ErrorCategory::Conflict,
                DatabaseError::Connection(_) => ErrorCategory::Transport,
                DatabaseError::Query(_) | DatabaseError::Migration(_) => ErrorCategory::Internal,
            },
            Self::TransferInFlight(_) => ErrorCategory::Conflict,
            Self::Inconsistency(_) => ErrorCategory::RecoverableInconsistency,
            Self::Invariant(_) => ErrorCategory::Fatal,
            Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    #[must_use]
    pub fn not_found(what: &str, id: &str) -> Self {
        Self::Database(DatabaseError::NotFound(format!("{what} {id}")))
    }

    #[must_use]
    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        Self::Validation(ValidationError::InvalidField {
            field: field.to_string(),
            message: message.into(),
        })
    }
}

/// Error taxonomy surfaced to callers
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// No state changed; safe to retry immediately once the input is fixed
    RejectedBeforeSubmission,
    /// Ledger or store unavailable, or pointed at the wrong network
    Transport,
    /// The ledger executed and rejected the operation
    Reverted,
    /// The two ledgers disagree; carries a tx ref for reconciliation
    RecoverableInconsistency,
    /// Invariant violated; the workflow was aborted without writing
    Fatal,
    NotFound,
    Conflict,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RejectedBeforeSubmission => "rejected_before_submission",
            Self::Transport => "transport",
            Self::Reverted => "reverted",
            Self::RecoverableInconsistency => "recoverable_inconsistency",
            Self::Fatal => "fatal",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
