//! Infrastructure layer implementations.

pub mod database;
pub mod ledger;
pub mod signer;

pub use database::{PostgresClient, PostgresConfig};
pub use ledger::{RpcClientConfig, RpcLedgerClient};
pub use signer::{SignerRegistry, signing_key_from_base58};
