//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use tracing::{error, warn};
use utoipa::OpenApi;

use crate::app::AppState;
use crate::domain::{
    AppError, BalanceCheck, CheckBalancesRequest, CreateTransferRequest, CreateTransferResponse,
    CustodyRecord, DatabaseError, ErrorDetail, ErrorResponse, HealthResponse, HealthStatus,
    LedgerError, MintBatchRequest, MintBatchResponse, RecoverMintRequest, SubmitTransferResponse,
    UnitBatch, UpdateBatchStatusRequest, UpdateRecordStatusRequest,
};

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Custody Ledger Relayer API",
        version = "0.1.0",
        description = "API for minting unit tokens and recording custody transfers against the token ledger",
        license(
            name = "MIT"
        )
    ),
    paths(
        mint_batch_handler,
        recover_mint_handler,
        get_batch_handler,
        update_batch_status_handler,
        create_transfer_handler,
        get_custody_record_handler,
        submit_transfer_handler,
        cancel_transfer_handler,
        confirm_receipt_handler,
        advance_record_status_handler,
        check_balances_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
    ),
    components(
        schemas(
            MintBatchRequest,
            MintBatchResponse,
            RecoverMintRequest,
            UnitBatch,
            UpdateBatchStatusRequest,
            crate::domain::BatchStatus,
            CreateTransferRequest,
            CreateTransferResponse,
            CustodyRecord,
            crate::domain::CustodySource,
            crate::domain::CustodyStatus,
            crate::domain::PartyRole,
            SubmitTransferResponse,
            crate::domain::SubmitOutcome,
            UpdateRecordStatusRequest,
            CheckBalancesRequest,
            BalanceCheck,
            crate::domain::Shortfall,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            crate::domain::Inconsistency,
            crate::domain::InconsistencyKind,
        )
    ),
    tags(
        (name = "batches", description = "Batch minting and lifecycle"),
        (name = "custody", description = "Custody transfer records"),
        (name = "balances", description = "Ledger balance checks"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Mint a production batch
///
/// Mints one unit token per item on the ledger, waits for finalization and
/// records the batch with the resolved token ids. When the mint finalized but
/// could not be recorded, the `409` response carries the `tx_ref` to pass to
/// `POST /batches/recover`.
#[utoipa::path(
    post,
    path = "/batches",
    tag = "batches",
    request_body = MintBatchRequest,
    responses(
        (status = 200, description = "Batch minted and recorded", body = MintBatchResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 403, description = "No signing key or ledger role for the producer", body = ErrorResponse),
        (status = 409, description = "Mint finalized but not recorded", body = ErrorResponse),
        (status = 422, description = "Mint reverted on the ledger", body = ErrorResponse),
        (status = 503, description = "Ledger or store unavailable", body = ErrorResponse)
    )
)]
pub async fn mint_batch_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MintBatchRequest>,
) -> Result<Json<MintBatchResponse>, AppError> {
    let signer = state.signer_for(&payload.producer_address)?;
    let batch = state.orchestrator.mint_batch(signer, &payload).await?;
    Ok(Json(MintBatchResponse::from(&batch)))
}

/// Record a mint that finalized without being recorded
///
/// Never mints again: the receipt of `tx_ref` is re-read and the batch is
/// recorded from it. Returns the existing batch when already recorded.
#[utoipa::path(
    post,
    path = "/batches/recover",
    tag = "batches",
    request_body = RecoverMintRequest,
    responses(
        (status = 200, description = "Batch recorded", body = MintBatchResponse),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "Token ids still unresolved", body = ErrorResponse),
        (status = 422, description = "Mint reverted on the ledger", body = ErrorResponse)
    )
)]
pub async fn recover_mint_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RecoverMintRequest>,
) -> Result<Json<MintBatchResponse>, AppError> {
    let batch = state.orchestrator.recover_mint(&payload).await?;
    Ok(Json(MintBatchResponse::from(&batch)))
}

#[utoipa::path(
    get,
    path = "/batches/{id}",
    tag = "batches",
    params(
        ("id" = String, Path, description = "Batch ID")
    ),
    responses(
        (status = 200, description = "Batch found", body = UnitBatch),
        (status = 404, description = "Batch not found", body = ErrorResponse)
    )
)]
pub async fn get_batch_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UnitBatch>, AppError> {
    let batch = state.orchestrator.get_batch(&id).await?;
    Ok(Json(batch))
}

/// Mark a batch sold, expired or recalled
#[utoipa::path(
    post,
    path = "/batches/{id}/status",
    tag = "batches",
    params(
        ("id" = String, Path, description = "Batch ID")
    ),
    request_body = UpdateBatchStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = UnitBatch),
        (status = 400, description = "Transition not allowed", body = ErrorResponse),
        (status = 404, description = "Batch not found", body = ErrorResponse)
    )
)]
pub async fn update_batch_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateBatchStatusRequest>,
) -> Result<Json<UnitBatch>, AppError> {
    let batch = state
        .orchestrator
        .update_batch_status(&id, payload.status)
        .await?;
    Ok(Json(batch))
}

/// Create a draft custody transfer
///
/// Assigns the lowest unallocated token ids of the source. Nothing is sent
/// to the ledger until `POST /custody-records/{id}/submit`.
#[utoipa::path(
    post,
    path = "/custody-records",
    tag = "custody",
    request_body = CreateTransferRequest,
    responses(
        (status = 200, description = "Draft created", body = CreateTransferResponse),
        (status = 400, description = "Validation error or not enough units", body = ErrorResponse),
        (status = 404, description = "Source not found", body = ErrorResponse)
    )
)]
pub async fn create_transfer_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTransferRequest>,
) -> Result<Json<CreateTransferResponse>, AppError> {
    let response = state.orchestrator.create_transfer(&payload).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/custody-records/{id}",
    tag = "custody",
    params(
        ("id" = String, Path, description = "Custody record ID")
    ),
    responses(
        (status = 200, description = "Custody record found", body = CustodyRecord),
        (status = 404, description = "Custody record not found", body = ErrorResponse)
    )
)]
pub async fn get_custody_record_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CustodyRecord>, AppError> {
    let record = state.orchestrator.get_custody_record(&id).await?;
    Ok(Json(record))
}

/// Submit a draft's transfer to the ledger
///
/// Idempotent. `outcome` tells what this call did:
/// - `finalized` → submitted and finalized now
/// - `already_finalized` → nothing submitted, existing `tx_ref` returned
/// - `reconciled` → an earlier attempt was found finalized and attached
/// - `pending` → submitted, not finalized yet; call again to reconcile
#[utoipa::path(
    post,
    path = "/custody-records/{id}/submit",
    tag = "custody",
    params(
        ("id" = String, Path, description = "Custody record ID")
    ),
    responses(
        (status = 200, description = "Submit concluded", body = SubmitTransferResponse),
        (status = 403, description = "No signing key or ledger role for the holder", body = ErrorResponse),
        (status = 404, description = "Custody record not found", body = ErrorResponse),
        (status = 409, description = "Submit in flight, or ledgers disagree", body = ErrorResponse),
        (status = 422, description = "Insufficient balance or transfer reverted", body = ErrorResponse),
        (status = 503, description = "Ledger or store unavailable", body = ErrorResponse)
    )
)]
pub async fn submit_transfer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SubmitTransferResponse>, AppError> {
    let record = state.orchestrator.get_custody_record(&id).await?;
    let signer = state.signer_for(&record.source_address)?;
    let response = state.orchestrator.submit_transfer(signer, &id).await?;
    Ok(Json(response))
}

/// Cancel a draft custody record
#[utoipa::path(
    post,
    path = "/custody-records/{id}/cancel",
    tag = "custody",
    params(
        ("id" = String, Path, description = "Custody record ID")
    ),
    responses(
        (status = 200, description = "Record cancelled", body = CustodyRecord),
        (status = 400, description = "Record is not a cancellable draft", body = ErrorResponse),
        (status = 404, description = "Custody record not found", body = ErrorResponse),
        (status = 409, description = "Submit in flight", body = ErrorResponse)
    )
)]
pub async fn cancel_transfer_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CustodyRecord>, AppError> {
    let record = state.orchestrator.cancel_transfer(&id).await?;
    Ok(Json(record))
}

/// Confirm the destination received the units
///
/// Re-reads the transfer receipt and checks it moved the record's token ids
/// before moving `sent` to `received`.
#[utoipa::path(
    post,
    path = "/custody-records/{id}/receive",
    tag = "custody",
    params(
        ("id" = String, Path, description = "Custody record ID")
    ),
    responses(
        (status = 200, description = "Record received", body = CustodyRecord),
        (status = 400, description = "Record is not sent", body = ErrorResponse),
        (status = 404, description = "Custody record not found", body = ErrorResponse),
        (status = 409, description = "Ledger does not show the transfer", body = ErrorResponse)
    )
)]
pub async fn confirm_receipt_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CustodyRecord>, AppError> {
    let record = state.orchestrator.confirm_receipt(&id).await?;
    Ok(Json(record))
}

/// Advance a received record to `confirmed` or `paid`
#[utoipa::path(
    post,
    path = "/custody-records/{id}/status",
    tag = "custody",
    params(
        ("id" = String, Path, description = "Custody record ID")
    ),
    request_body = UpdateRecordStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = CustodyRecord),
        (status = 400, description = "Transition not allowed", body = ErrorResponse),
        (status = 404, description = "Custody record not found", body = ErrorResponse)
    )
)]
pub async fn advance_record_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateRecordStatusRequest>,
) -> Result<Json<CustodyRecord>, AppError> {
    let record = state
        .orchestrator
        .advance_status(&id, payload.status)
        .await?;
    Ok(Json(record))
}

/// Check a holder's ledger balances
///
/// Each listed token id needs one unit unless `amounts` says otherwise.
/// Amounts for repeated ids are added up.
#[utoipa::path(
    post,
    path = "/balances/check",
    tag = "balances",
    request_body = CheckBalancesRequest,
    responses(
        (status = 200, description = "Balances checked", body = BalanceCheck),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 503, description = "Ledger unavailable", body = ErrorResponse)
    )
)]
pub async fn check_balances_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CheckBalancesRequest>,
) -> Result<Json<BalanceCheck>, AppError> {
    let check = state.orchestrator.check_balances(&payload).await?;
    Ok(Json(check))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.orchestrator.health_check().await;
    Json(health)
}

/// Liveness check for the orchestrator platform
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check for the orchestrator platform
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.orchestrator.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, "database_error"),
                DatabaseError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                DatabaseError::Duplicate(_) => (StatusCode::CONFLICT, "duplicate"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            },
            AppError::Ledger(ledger_err) => match ledger_err {
                LedgerError::Connection { .. } | LedgerError::ContractNotDeployed { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "ledger_unavailable")
                }
                LedgerError::WrongNetwork { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "wrong_network")
                }
                LedgerError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                LedgerError::NotFinalized { .. } => (StatusCode::GATEWAY_TIMEOUT, "not_finalized"),
                LedgerError::RpcError(_) => (StatusCode::BAD_GATEWAY, "ledger_error"),
                LedgerError::MissingRole { .. } => (StatusCode::FORBIDDEN, "missing_role"),
                LedgerError::SignerRejected(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "signer_rejected")
                }
                LedgerError::Reverted { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "transaction_reverted")
                }
                LedgerError::InvalidKey(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
                }
            },
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
            AppError::Authorization(_) => (StatusCode::FORBIDDEN, "authorization_error"),
            AppError::TransferInFlight(_) => (StatusCode::CONFLICT, "transfer_in_flight"),
            AppError::InsufficientBalance { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_balance")
            }
            AppError::Inconsistency(_) => (StatusCode::CONFLICT, "recoverable_inconsistency"),
            AppError::Invariant(_) => (StatusCode::INTERNAL_SERVER_ERROR, "invariant_violation"),
            AppError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let details = match &self {
            AppError::InsufficientBalance {
                record_id,
                shortfalls,
            } => Some(json!({ "record_id": record_id, "shortfalls": shortfalls })),
            AppError::Inconsistency(inconsistency) => serde_json::to_value(inconsistency).ok(),
            AppError::TransferInFlight(record_id) => Some(json!({ "record_id": record_id })),
            _ => None,
        };

        let message = self.to_string();
        let category = self.category();
        if status.is_server_error() {
            error!(error_type = %error_type, category = %category, message = %message, "Server error");
        } else if matches!(self, AppError::Inconsistency(_)) {
            warn!(message = %message, "Ledgers disagree; reconciliation needed");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                category: category.to_string(),
                message,
                details,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{InconsistencyKind, Shortfall};
    use http_body_util::BodyExt;

    async fn body_json(err: AppError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_insufficient_balance_lists_shortfalls() {
        let (status, body) = body_json(AppError::InsufficientBalance {
            record_id: "r1".to_string(),
            shortfalls: vec![Shortfall {
                token_id: 9,
                held: "7".to_string(),
                needed: "10".to_string(),
            }],
        })
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["type"], "insufficient_balance");
        assert_eq!(body["error"]["category"], "rejected_before_submission");
        assert_eq!(body["error"]["details"]["shortfalls"][0]["held"], "7");
        assert_eq!(body["error"]["details"]["shortfalls"][0]["needed"], "10");
    }

    #[tokio::test]
    async fn test_inconsistency_carries_tx_ref() {
        let (status, body) = body_json(AppError::inconsistency(
            InconsistencyKind::TransferNotRecorded,
            "0xabc",
            Some("r1".to_string()),
            "custody record sent",
            "connection reset",
        ))
        .await;

        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["category"], "recoverable_inconsistency");
        assert_eq!(body["error"]["details"]["tx_ref"], "0xabc");
        assert_eq!(body["error"]["details"]["kind"], "transfer_not_recorded");
    }

    #[tokio::test]
    async fn test_wrong_network_is_transport() {
        let (status, body) = body_json(AppError::Ledger(LedgerError::WrongNetwork {
            endpoint: "http://node:8545".to_string(),
            expected: "custody-mainnet".to_string(),
            actual: "custody-devnet".to_string(),
        }))
        .await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["category"], "transport");
        assert!(body["error"].get("details").is_none());
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("http://node:8545"));
        assert!(message.contains("custody-mainnet"));
    }
}
