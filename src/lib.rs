//! Custody transfer and ledger reconciliation service.
//!
//! Mints unit tokens for production batches, records which token ids belong to
//! which off-chain custody record, executes custody transfers on the token
//! ledger and reconciles partial failures between the two systems of record.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
