//! JSON-RPC client for the token ledger gateway.
//!
//! Read calls are retried with a fixed delay. State-changing calls are sent
//! exactly once per invocation, each signed with a fresh nonce, after the
//! endpoint network, contract deployment and signer role have been checked.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AppError, LedgerClient, LedgerError, PartyRole, Signer, TokenId, TransferCall, TxReceipt,
};

/// Configuration for the RPC client
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Confirmations after which a successful receipt is final
    pub required_confirmations: u64,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            required_confirmations: 2,
        }
    }
}

/// Abstract transport for ledger RPC calls to enable testing
#[async_trait]
pub trait LedgerRpcProvider: Send + Sync {
    /// Send a JSON-RPC request; a `null` result is returned as `Value::Null`
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, AppError>;

    /// Endpoint named in diagnostics
    fn endpoint(&self) -> &str;
}

/// HTTP-based ledger RPC provider
pub struct HttpLedgerRpcProvider {
    http_client: Client,
    rpc_url: String,
}

impl HttpLedgerRpcProvider {
    pub fn new(rpc_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let http_client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::Ledger(LedgerError::Connection {
                endpoint: rpc_url.to_string(),
                message: e.to_string(),
            })
        })?;

        Ok(Self {
            http_client,
            rpc_url: rpc_url.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    params: T,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// JSON-RPC error code used by wallets for a user-declined signature
const USER_REJECTED_CODE: i64 = 4001;

/// JSON-RPC error code carrying an execution revert
const EXECUTION_REVERTED_CODE: i64 = 3;

fn map_rpc_error(error: JsonRpcError) -> AppError {
    let message = error.message.to_lowercase();
    if error.code == USER_REJECTED_CODE || message.contains("rejected") || message.contains("denied")
    {
        return AppError::Ledger(LedgerError::SignerRejected(error.message));
    }
    if error.code == EXECUTION_REVERTED_CODE || message.contains("revert") {
        return AppError::Ledger(LedgerError::Reverted {
            tx_ref: "not broadcast".to_string(),
            reason: error.message,
        });
    }
    AppError::Ledger(LedgerError::RpcError(format!(
        "{}: {}",
        error.code, error.message
    )))
}

#[async_trait]
impl LedgerRpcProvider for HttpLedgerRpcProvider {
    async fn send_request(&self, method: &str, params: Value) -> Result<Value, AppError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: method.to_string(),
            params,
        };

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Ledger(LedgerError::Timeout(format!("{}: {}", self.rpc_url, e)))
                } else if e.is_connect() {
                    AppError::Ledger(LedgerError::Connection {
                        endpoint: self.rpc_url.clone(),
                        message: e.to_string(),
                    })
                } else {
                    AppError::Ledger(LedgerError::RpcError(e.to_string()))
                }
            })?;

        if !response.status().is_success() {
            return Err(AppError::Ledger(LedgerError::RpcError(format!(
                "{} returned HTTP {}",
                self.rpc_url,
                response.status()
            ))));
        }

        let rpc_response: JsonRpcResponse<Value> = response
            .json()
            .await
            .map_err(|e| AppError::Ledger(LedgerError::RpcError(e.to_string())))?;

        if let Some(error) = rpc_response.error {
            return Err(map_rpc_error(error));
        }

        Ok(rpc_response.result.unwrap_or(Value::Null))
    }

    fn endpoint(&self) -> &str {
        &self.rpc_url
    }
}

/// A state-changing request, signed by the submitting party.
///
/// The digest is the SHA-256 of the canonical JSON of every other field;
/// `serde_json` orders object keys, so the encoding is stable.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedSubmission {
    pub method: String,
    pub contract: String,
    pub chain_id: String,
    pub signer: String,
    /// Fresh per attempt so the gateway can reject replays
    pub nonce: String,
    pub payload: Value,
    pub digest: String,
    pub signature: String,
}

impl SignedSubmission {
    pub fn new(
        signer: &Signer,
        method: &str,
        contract: &str,
        chain_id: &str,
        payload: Value,
    ) -> Result<Self, AppError> {
        let nonce = Uuid::now_v7().to_string();
        let canonical = serde_json::to_vec(&json!({
            "method": method,
            "contract": contract,
            "chainId": chain_id,
            "signer": signer.address(),
            "nonce": nonce,
            "payload": payload,
        }))
        .map_err(|e| AppError::Serialization(e.to_string()))?;

        let digest = Sha256::digest(&canonical);
        Ok(Self {
            method: method.to_string(),
            contract: contract.to_string(),
            chain_id: chain_id.to_string(),
            signer: signer.address().to_string(),
            nonce,
            payload,
            digest: bs58::encode(digest).into_string(),
            signature: signer.sign(&digest),
        })
    }
}

/// Balances travel as decimal strings; some gateways send small ones as numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Quantity {
    Decimal(String),
    Number(u64),
}

impl Quantity {
    fn into_u128(self) -> Result<u128, AppError> {
        match self {
            Self::Number(n) => Ok(u128::from(n)),
            Self::Decimal(s) => s.parse::<u128>().map_err(|e| {
                AppError::Ledger(LedgerError::RpcError(format!(
                    "Invalid balance '{}': {}",
                    s, e
                )))
            }),
        }
    }
}

/// Token ledger client over JSON-RPC
pub struct RpcLedgerClient {
    provider: Box<dyn LedgerRpcProvider>,
    config: RpcClientConfig,
    contract_address: String,
    expected_chain_id: String,
}

impl RpcLedgerClient {
    /// Create a new ledger client with custom configuration
    pub fn new(
        rpc_url: &str,
        contract_address: &str,
        expected_chain_id: &str,
        config: RpcClientConfig,
    ) -> Result<Self, AppError> {
        let provider = HttpLedgerRpcProvider::new(rpc_url, config.timeout)?;
        info!(rpc_url = %rpc_url, contract = %contract_address, chain_id = %expected_chain_id, "Created ledger client");
        Ok(Self::with_provider(
            Box::new(provider),
            contract_address,
            expected_chain_id,
            config,
        ))
    }

    /// Create a new client with a specific provider (useful for testing)
    pub fn with_provider(
        provider: Box<dyn LedgerRpcProvider>,
        contract_address: &str,
        expected_chain_id: &str,
        config: RpcClientConfig,
    ) -> Self {
        Self {
            provider,
            config,
            contract_address: contract_address.to_string(),
            expected_chain_id: expected_chain_id.to_string(),
        }
    }

    #[must_use]
    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Make a read-only RPC call with retries
    #[instrument(skip(self, params))]
    async fn rpc_call<R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<R, AppError> {
        let mut last_error = None;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match self.provider.send_request(method, params.clone()).await {
                Ok(result) => return decode(method, result),
                Err(e) => {
                    warn!(attempt = attempt, error = ?e, method = %method, "RPC call failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::Ledger(LedgerError::RpcError("Unknown error".to_string()))
        }))
    }

    /// Network, deployment and role checks ahead of a state-changing call
    async fn preflight(&self, signer: &Signer, role: PartyRole) -> Result<(), AppError> {
        let actual = self.chain_id().await?;
        if actual != self.expected_chain_id {
            return Err(AppError::Ledger(LedgerError::WrongNetwork {
                endpoint: self.provider.endpoint().to_string(),
                expected: self.expected_chain_id.clone(),
                actual,
            }));
        }
        if !self.is_deployed(&self.contract_address).await? {
            return Err(AppError::Ledger(LedgerError::ContractNotDeployed {
                address: self.contract_address.clone(),
                endpoint: self.provider.endpoint().to_string(),
            }));
        }
        if !self.has_role(signer.address(), role).await? {
            return Err(AppError::Ledger(LedgerError::MissingRole {
                address: signer.address().to_string(),
                role: role.ledger_role().to_string(),
            }));
        }
        Ok(())
    }

    /// Send a signed state-changing request once; never retried
    async fn submit(&self, signer: &Signer, method: &str, payload: Value) -> Result<String, AppError> {
        let submission = SignedSubmission::new(
            signer,
            method,
            &self.contract_address,
            &self.expected_chain_id,
            payload,
        )?;
        let params = serde_json::to_value([&submission])
            .map_err(|e| AppError::Serialization(e.to_string()))?;

        let result = self.provider.send_request(method, params).await?;
        let tx_ref: String = decode(method, result)?;
        if tx_ref.is_empty() {
            return Err(AppError::Ledger(LedgerError::RpcError(format!(
                "{} returned an empty transaction reference",
                method
            ))));
        }
        Ok(tx_ref)
    }
}

fn decode<R: DeserializeOwned>(method: &str, value: Value) -> Result<R, AppError> {
    serde_json::from_value(value).map_err(|e| {
        AppError::Ledger(LedgerError::RpcError(format!(
            "Unexpected {} response: {}",
            method, e
        )))
    })
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let _: u64 = self.rpc_call("ledger_blockNumber", json!([])).await?;
        Ok(())
    }

    async fn chain_id(&self) -> Result<String, AppError> {
        self.rpc_call("ledger_chainId", json!([])).await
    }

    async fn is_deployed(&self, address: &str) -> Result<bool, AppError> {
        let code: Option<String> = self.rpc_call("ledger_getCode", json!([address])).await?;
        Ok(code.is_some_and(|c| !c.is_empty() && c != "0x"))
    }

    async fn has_role(&self, address: &str, role: PartyRole) -> Result<bool, AppError> {
        self.rpc_call(
            "ledger_hasRole",
            json!([self.contract_address, role.ledger_role(), address]),
        )
        .await
    }

    async fn balance_of(&self, address: &str, token_id: TokenId) -> Result<u128, AppError> {
        let quantity: Quantity = self
            .rpc_call(
                "ledger_balanceOf",
                json!([self.contract_address, address, token_id]),
            )
            .await?;
        quantity.into_u128()
    }

    #[instrument(skip(self, signer), fields(signer = %signer.address()))]
    async fn mint(
        &self,
        signer: &Signer,
        quantity: u32,
        metadata_ref: &str,
    ) -> Result<String, AppError> {
        self.preflight(signer, PartyRole::Producer).await?;
        let payload = json!({
            "to": signer.address(),
            "quantity": quantity,
            "metadataRef": metadata_ref,
        });
        let tx_ref = self.submit(signer, "ledger_mint", payload).await?;
        info!(tx_ref = %tx_ref, "Mint accepted by ledger");
        Ok(tx_ref)
    }

    #[instrument(skip(self, signer, call), fields(signer = %signer.address(), units = call.token_ids.len()))]
    async fn transfer(
        &self,
        signer: &Signer,
        call: &TransferCall,
        from_role: PartyRole,
    ) -> Result<String, AppError> {
        if call.token_ids.is_empty() || call.token_ids.len() != call.amounts.len() {
            return Err(AppError::invalid_field(
                "token_ids",
                "Transfer needs one amount per token id and at least one token",
            ));
        }
        if signer.address() != call.from {
            return Err(AppError::Authorization(format!(
                "Signer {} cannot move units held by {}",
                signer.address(),
                call.from
            )));
        }
        self.preflight(signer, from_role).await?;

        let (method, payload) = if call.is_single() {
            (
                "ledger_safeTransferFrom",
                json!({
                    "from": call.from,
                    "to": call.to,
                    "id": call.token_ids[0],
                    "amount": call.amounts[0],
                    "data": "",
                }),
            )
        } else {
            (
                "ledger_safeBatchTransferFrom",
                json!({
                    "from": call.from,
                    "to": call.to,
                    "ids": call.token_ids,
                    "amounts": call.amounts,
                    "data": "",
                }),
            )
        };
        let tx_ref = self.submit(signer, method, payload).await?;
        info!(tx_ref = %tx_ref, method = %method, "Transfer accepted by ledger");
        Ok(tx_ref)
    }

    async fn get_receipt(&self, tx_ref: &str) -> Result<Option<TxReceipt>, AppError> {
        self.rpc_call("ledger_getTransactionReceipt", json!([tx_ref]))
            .await
    }

    fn required_confirmations(&self) -> u64 {
        self.config.required_confirmations
    }
}
