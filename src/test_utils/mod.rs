//! Test utilities and mock implementations.

pub mod mocks;

pub use mocks::{
    MintEventMode, MockConfig, MockDatabaseClient, MockLedgerClient, test_signer,
};
