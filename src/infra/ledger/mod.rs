//! Token ledger client implementations.

pub mod rpc;

pub use rpc::{
    HttpLedgerRpcProvider, LedgerRpcProvider, RpcClientConfig, RpcLedgerClient, SignedSubmission,
};
