//! Application entry point.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use custody_ledger_relayer::api::create_router;
use custody_ledger_relayer::app::{AppState, OrchestratorConfig};
use custody_ledger_relayer::infra::{
    PostgresClient, PostgresConfig, RpcClientConfig, RpcLedgerClient, SignerRegistry,
};

/// Application configuration
struct Config {
    database_url: String,
    ledger_rpc_url: String,
    contract_address: String,
    /// Network the ledger endpoint must report
    chain_id: String,
    required_confirmations: u64,
    signing_keys: SecretString,
    host: String,
    port: u16,
    orchestrator: OrchestratorConfig,
    json_logs: bool,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let ledger_rpc_url = env::var("LEDGER_RPC_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8545".to_string());
        let contract_address =
            env::var("LEDGER_CONTRACT_ADDRESS").context("LEDGER_CONTRACT_ADDRESS not set")?;
        let chain_id = env::var("LEDGER_CHAIN_ID").unwrap_or_else(|_| "custody-devnet".to_string());
        let required_confirmations = env::var("LEDGER_CONFIRMATIONS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(2);
        let finalization_timeout_secs = env::var("LEDGER_FINALIZATION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        let resolve_attempts = env::var("RESOLVE_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(3);
        let unknown_attempt_grace_secs = env::var("UNKNOWN_ATTEMPT_GRACE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(600);
        let accept_inferred_token_ids = env::var("ACCEPT_INFERRED_TOKEN_IDS")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let json_logs = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let keys = env::var("PARTY_SIGNING_KEYS").map_err(|_| {
            anyhow::anyhow!(
                "PARTY_SIGNING_KEYS environment variable is not set.\n\
                 Provide the comma-separated Base58 ed25519 keys of the parties this relayer signs for."
            )
        })?;

        Ok(Self {
            database_url,
            ledger_rpc_url,
            contract_address,
            chain_id,
            required_confirmations,
            signing_keys: SecretString::from(keys),
            host,
            port,
            orchestrator: OrchestratorConfig {
                finalization_timeout: Duration::from_secs(finalization_timeout_secs),
                resolve_attempts,
                accept_inferred_token_ids,
                unknown_attempt_grace: Duration::from_secs(unknown_attempt_grace_secs),
                ..Default::default()
            },
            json_logs,
        })
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(config.json_logs);

    info!("🏗️  Custody Ledger Relayer v{}", env!("CARGO_PKG_VERSION"));

    let signers = SignerRegistry::from_keys(&config.signing_keys)
        .context("Failed to parse PARTY_SIGNING_KEYS")?;
    for address in signers.addresses() {
        info!("🔑 Signing for {}", address);
    }

    info!("📦 Initializing infrastructure...");

    let postgres_client = PostgresClient::new(&config.database_url, PostgresConfig::default()).await?;
    postgres_client.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    let ledger_client = RpcLedgerClient::new(
        &config.ledger_rpc_url,
        &config.contract_address,
        &config.chain_id,
        RpcClientConfig {
            required_confirmations: config.required_confirmations,
            ..Default::default()
        },
    )?;
    info!(
        "   ✓ Ledger client created (network: {}, confirmations: {})",
        config.chain_id, config.required_confirmations
    );
    if config.orchestrator.accept_inferred_token_ids {
        warn!("   ⚠ Inferred token ids will be persisted when mint events are incomplete");
    }

    let app_state = Arc::new(AppState::with_config(
        Arc::new(postgres_client),
        Arc::new(ledger_client),
        signers,
        config.orchestrator.clone(),
    ));

    let health = app_state.orchestrator.health_check().await;
    info!(
        "   ✓ Health: database {:?}, ledger {:?}",
        health.database, health.ledger
    );

    let router = create_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}
