//! Token ledger types: transfer calls, receipts and the events they carry.

use serde::{Deserialize, Serialize};

/// Identifier of a single unit token on the ledger
pub type TokenId = u64;

/// Sender of mint transfers on the ledger
pub const NULL_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// True for the null/burn address in either hex or base58 form
pub fn is_null_address(address: &str) -> bool {
    match address.strip_prefix("0x") {
        Some(hex) => !hex.is_empty() && hex.bytes().all(|b| b == b'0'),
        None => !address.is_empty() && address.bytes().all(|b| b == b'1'),
    }
}

/// A custody transfer as submitted to the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferCall {
    pub from: String,
    pub to: String,
    pub token_ids: Vec<TokenId>,
    pub amounts: Vec<u64>,
}

impl TransferCall {
    /// One unit of each token, the shape of every custody transfer
    #[must_use]
    pub fn units(from: &str, to: &str, token_ids: &[TokenId]) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            token_ids: token_ids.to_vec(),
            amounts: vec![1; token_ids.len()],
        }
    }

    /// Single-item transfers use the cheaper single-token ledger call
    #[must_use]
    pub fn is_single(&self) -> bool {
        self.token_ids.len() == 1
    }
}

/// Execution status reported for a transaction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    /// Known to the ledger but not yet included
    Pending,
    Success,
    Reverted,
}

/// Events emitted by the token contract.
///
/// The set of encodings is closed; anything else decodes to `Unknown` and is
/// ignored by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Dedicated mint event listing the assigned ids
    UnitsMinted { to: String, token_ids: Vec<TokenId> },
    TransferSingle {
        operator: String,
        from: String,
        to: String,
        id: TokenId,
        value: u64,
    },
    TransferBatch {
        operator: String,
        from: String,
        to: String,
        ids: Vec<TokenId>,
        values: Vec<u64>,
    },
    #[serde(other)]
    Unknown,
}

/// A transaction receipt as observed on the ledger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_ref: String,
    pub status: ReceiptStatus,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub revert_reason: Option<String>,
    #[serde(default)]
    pub events: Vec<LedgerEvent>,
}

impl TxReceipt {
    /// Successful and buried under enough blocks to be irreversible
    #[must_use]
    pub fn is_finalized(&self, required_confirmations: u64) -> bool {
        self.status == ReceiptStatus::Success && self.confirmations >= required_confirmations
    }

    #[must_use]
    pub fn is_reverted(&self) -> bool {
        self.status == ReceiptStatus::Reverted
    }

    /// Token ids this receipt moved from `from` to `to`, ascending
    #[must_use]
    pub fn transferred_ids(&self, from: &str, to: &str) -> Vec<TokenId> {
        let mut ids: Vec<TokenId> = self
            .events
            .iter()
            .flat_map(|event| match event {
                LedgerEvent::TransferSingle {
                    from: f, to: t, id, value, ..
                } if f == from && t == to && *value > 0 => vec![*id],
                LedgerEvent::TransferBatch {
                    from: f,
                    to: t,
                    ids,
                    values,
                    ..
                } if f == from && t == to => ids
                    .iter()
                    .zip(values.iter())
                    .filter(|(_, v)| **v > 0)
                    .map(|(id, _)| *id)
                    .collect(),
                _ => Vec::new(),
            })
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_address_detection() {
        assert!(is_null_address(NULL_ADDRESS));
        assert!(is_null_address("0x0"));
        assert!(is_null_address("11111111111111111111111111111111"));
        assert!(!is_null_address(""));
        assert!(!is_null_address("0x00000000000000000000000000000000000000a1"));
    }

    #[test]
    fn test_event_decoding_with_unknown_fallback() {
        let json = serde_json::json!([
            {"event": "units_minted", "to": "prod", "token_ids": [4, 5]},
            {"event": "approval_for_all", "owner": "a", "operator": "b", "approved": true},
            {"event": "transfer_single", "operator": "op", "from": "a", "to": "b", "id": 9, "value": 1}
        ]);
        let events: Vec<LedgerEvent> = serde_json::from_value(json).unwrap();
        assert_eq!(
            events[0],
            LedgerEvent::UnitsMinted {
                to: "prod".to_string(),
                token_ids: vec![4, 5]
            }
        );
        assert_eq!(events[1], LedgerEvent::Unknown);
        assert!(matches!(events[2], LedgerEvent::TransferSingle { id: 9, .. }));
    }

    #[test]
    fn test_transferred_ids_filters_by_parties() {
        let receipt = TxReceipt {
            tx_ref: "0x1".to_string(),
            status: ReceiptStatus::Success,
            block_number: Some(10),
            confirmations: 3,
            revert_reason: None,
            events: vec![
                LedgerEvent::TransferBatch {
                    operator: "a".to_string(),
                    from: "a".to_string(),
                    to: "b".to_string(),
                    ids: vec![3, 1, 2],
                    values: vec![1, 1, 0],
                },
                LedgerEvent::TransferSingle {
                    operator: "a".to_string(),
                    from: "a".to_string(),
                    to: "c".to_string(),
                    id: 7,
                    value: 1,
                },
            ],
        };
        assert_eq!(receipt.transferred_ids("a", "b"), vec![1, 3]);
        assert_eq!(receipt.transferred_ids("a", "c"), vec![7]);
        assert!(receipt.is_finalized(3));
        assert!(!receipt.is_finalized(4));
    }

    #[test]
    fn test_transfer_call_units() {
        let call = TransferCall::units("a", "b", &[1, 2, 3]);
        assert_eq!(call.amounts, vec![1, 1, 1]);
        assert!(!call.is_single());
        assert!(TransferCall::units("a", "b", &[1]).is_single());
    }
}
