//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod ledger;
pub mod signer;
pub mod traits;
pub mod types;

pub use error::{
    AppError, ConfigError, DatabaseError, ErrorCategory, Inconsistency, InconsistencyKind,
    LedgerError, ValidationError,
};
pub use ledger::{
    LedgerEvent, NULL_ADDRESS, ReceiptStatus, TokenId, TransferCall, TxReceipt, is_null_address,
};
pub use signer::Signer;
pub use traits::{DatabaseClient, LedgerClient};
pub use types::{
    BalanceCheck, BatchStatus, CheckBalancesRequest, CreateTransferRequest,
    CreateTransferResponse, CustodyRecord, CustodySource, CustodyStatus, ErrorDetail,
    ErrorResponse, HealthResponse, HealthStatus, MintBatchRequest, MintBatchResponse,
    NewCustodyRecord, NewUnitBatch, PartyRole, RecoverMintRequest, Shortfall, SubmitOutcome,
    SubmitTransferResponse, UnitBatch, UpdateBatchStatusRequest, UpdateRecordStatusRequest,
};
