//! Route table and middleware stack.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::app::AppState;

use super::handlers::{
    ApiDoc, advance_record_status_handler, cancel_transfer_handler, check_balances_handler,
    confirm_receipt_handler, create_transfer_handler, get_batch_handler,
    get_custody_record_handler, health_check_handler, liveness_handler, mint_batch_handler,
    readiness_handler, recover_mint_handler, submit_transfer_handler,
    update_batch_status_handler,
};

/// Upper bound for a single request, finalization waits included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest accepted JSON body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/batches", post(mint_batch_handler))
        .route("/batches/recover", post(recover_mint_handler))
        .route("/batches/{id}", get(get_batch_handler))
        .route("/batches/{id}/status", post(update_batch_status_handler))
        .route("/custody-records", post(create_transfer_handler))
        .route("/custody-records/{id}", get(get_custody_record_handler))
        .route("/custody-records/{id}/submit", post(submit_transfer_handler))
        .route("/custody-records/{id}/cancel", post(cancel_transfer_handler))
        .route("/custody-records/{id}/receive", post(confirm_receipt_handler))
        .route(
            "/custody-records/{id}/status",
            post(advance_record_status_handler),
        )
        .route("/balances/check", post(check_balances_handler))
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
