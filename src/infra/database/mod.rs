//! Off-chain store implementations.

pub mod postgres;

pub use postgres::{PostgresClient, PostgresConfig};
