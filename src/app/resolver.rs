//! Token id recovery from finalized mint receipts.
//!
//! The ledger assigns token ids during execution, so they are only known once
//! the mint is finalized and its events can be read back.

use crate::domain::{LedgerEvent, TokenId, TxReceipt, is_null_address};

/// Known ways a mint reveals its token ids, tried in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Dedicated mint event listing the ids
    MintedEvent,
    /// Transfer events whose sender is the null address
    NullSenderTransfer,
}

impl ExtractionStrategy {
    pub const ORDERED: [ExtractionStrategy; 2] = [Self::MintedEvent, Self::NullSenderTransfer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MintedEvent => "minted_event",
            Self::NullSenderTransfer => "null_sender_transfer",
        }
    }

    /// Ids carried by the events this strategy understands, in event order
    #[must_use]
    pub fn extract(&self, events: &[LedgerEvent]) -> Vec<TokenId> {
        match self {
            Self::MintedEvent => events
                .iter()
                .flat_map(|event| match event {
                    LedgerEvent::UnitsMinted { token_ids, .. } => token_ids.clone(),
                    _ => Vec::new(),
                })
                .collect(),
            Self::NullSenderTransfer => events
                .iter()
                .flat_map(|event| match event {
                    LedgerEvent::TransferSingle { from, id, .. } if is_null_address(from) => {
                        vec![*id]
                    }
                    LedgerEvent::TransferBatch { from, ids, .. } if is_null_address(from) => {
                        ids.clone()
                    }
                    _ => Vec::new(),
                })
                .collect(),
        }
    }
}

impl std::fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of resolving a mint's token ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every id was read from events; `trimmed` excess ids were dropped
    Complete {
        token_ids: Vec<TokenId>,
        strategy: ExtractionStrategy,
        trimmed: usize,
    },
    /// Fewer ids were found than requested; the last `inferred` ids were
    /// derived by counting up from the highest one found
    GapFilled {
        token_ids: Vec<TokenId>,
        inferred: usize,
        strategy: ExtractionStrategy,
    },
    /// No known event encoding yielded a single id
    Unresolved { requested: usize },
}

impl Resolution {
    /// Resolved ids, if any; gap-filled ids included
    #[must_use]
    pub fn token_ids(&self) -> Option<&[TokenId]> {
        match self {
            Self::Complete { token_ids, .. } | Self::GapFilled { token_ids, .. } => {
                Some(token_ids)
            }
            Self::Unresolved { .. } => None,
        }
    }
}

/// Recovers the token ids assigned by a mint
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenIdResolver;

impl TokenIdResolver {
    /// Resolve exactly `requested` ids from a finalized mint receipt.
    ///
    /// The first strategy yielding any id wins. Ids are sorted ascending and
    /// deduplicated; excess is trimmed from the end.
    #[must_use]
    pub fn resolve(receipt: &TxReceipt, requested: usize) -> Resolution {
        Self::resolve_events(&receipt.events, requested)
    }

    #[must_use]
    pub fn resolve_events(events: &[LedgerEvent], requested: usize) -> Resolution {
        if requested == 0 {
            return Resolution::Unresolved { requested };
        }

        let found = ExtractionStrategy::ORDERED.iter().find_map(|strategy| {
            let mut ids = strategy.extract(events);
            ids.sort_unstable();
            ids.dedup();
            (!ids.is_empty()).then_some((*strategy, ids))
        });

        let Some((strategy, mut token_ids)) = found else {
            return Resolution::Unresolved { requested };
        };

        if token_ids.len() >= requested {
            let trimmed = token_ids.len() - requested;
            token_ids.truncate(requested);
            return Resolution::Complete {
                token_ids,
                strategy,
                trimmed,
            };
        }

        let inferred = requested - token_ids.len();
        let Some(last) = token_ids.last().copied() else {
            return Resolution::Unresolved { requested };
        };
        for step in 1..=inferred as u64 {
            match last.checked_add(step) {
                Some(id) => token_ids.push(id),
                None => return Resolution::Unresolved { requested },
            }
        }

        Resolution::GapFilled {
            token_ids,
            inferred,
            strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NULL_ADDRESS;

    fn minted(ids: Vec<TokenId>) -> LedgerEvent {
        LedgerEvent::UnitsMinted {
            to: "producer".to_string(),
            token_ids: ids,
        }
    }

    fn mint_transfer(ids: Vec<TokenId>) -> LedgerEvent {
        LedgerEvent::TransferBatch {
            operator: "producer".to_string(),
            from: NULL_ADDRESS.to_string(),
            to: "producer".to_string(),
            values: vec![1; ids.len()],
            ids,
        }
    }

    #[test]
    fn test_prefers_minted_event() {
        let events = vec![mint_transfer(vec![100, 101]), minted(vec![3, 1, 2])];
        let resolution = TokenIdResolver::resolve_events(&events, 3);
        assert_eq!(
            resolution,
            Resolution::Complete {
                token_ids: vec![1, 2, 3],
                strategy: ExtractionStrategy::MintedEvent,
                trimmed: 0,
            }
        );
    }

    #[test]
    fn test_falls_back_to_null_sender_transfers() {
        let events = vec![
            LedgerEvent::Unknown,
            LedgerEvent::TransferSingle {
                operator: "op".to_string(),
                from: "someone".to_string(),
                to: "producer".to_string(),
                id: 999,
                value: 1,
            },
            mint_transfer(vec![11, 10]),
            LedgerEvent::TransferSingle {
                operator: "op".to_string(),
                from: NULL_ADDRESS.to_string(),
                to: "producer".to_string(),
                id: 12,
                value: 1,
            },
        ];
        let resolution = TokenIdResolver::resolve_events(&events, 3);
        assert_eq!(resolution.token_ids(), Some(&[10, 11, 12][..]));
        assert!(matches!(
            resolution,
            Resolution::Complete {
                strategy: ExtractionStrategy::NullSenderTransfer,
                ..
            }
        ));
    }

    #[test]
    fn test_gap_fill_counts_up_from_last_id() {
        let n: TokenId = 1_000;
        let ids: Vec<TokenId> = (n - 47..=n).collect();
        assert_eq!(ids.len(), 48);

        let resolution = TokenIdResolver::resolve_events(&[minted(ids)], 50);
        match resolution {
            Resolution::GapFilled {
                token_ids,
                inferred,
                strategy,
            } => {
                assert_eq!(token_ids.len(), 50);
                assert_eq!(inferred, 2);
                assert_eq!(strategy, ExtractionStrategy::MintedEvent);
                assert_eq!(&token_ids[48..], &[n + 1, n + 2]);
                assert!(token_ids.windows(2).all(|w| w[0] < w[1]));
            }
            other => panic!("expected gap fill, got {:?}", other),
        }
    }

    #[test]
    fn test_excess_ids_trimmed_from_end() {
        let resolution = TokenIdResolver::resolve_events(&[minted(vec![5, 6, 7, 8])], 2);
        assert_eq!(
            resolution,
            Resolution::Complete {
                token_ids: vec![5, 6],
                strategy: ExtractionStrategy::MintedEvent,
                trimmed: 2,
            }
        );
    }

    #[test]
    fn test_duplicates_do_not_count_twice() {
        let resolution = TokenIdResolver::resolve_events(&[minted(vec![4, 4, 5])], 3);
        assert_eq!(resolution.token_ids(), Some(&[4, 5, 6][..]));
        assert!(matches!(resolution, Resolution::GapFilled { inferred: 1, .. }));
    }

    #[test]
    fn test_zero_ids_is_unresolved() {
        let resolution = TokenIdResolver::resolve_events(&[LedgerEvent::Unknown], 5);
        assert_eq!(resolution, Resolution::Unresolved { requested: 5 });
        assert!(resolution.token_ids().is_none());

        let empty_minted = TokenIdResolver::resolve_events(&[minted(vec![])], 1);
        assert_eq!(empty_minted, Resolution::Unresolved { requested: 1 });
    }

    #[test]
    fn test_gap_fill_overflow_is_unresolved() {
        let resolution = TokenIdResolver::resolve_events(&[minted(vec![u64::MAX])], 2);
        assert_eq!(resolution, Resolution::Unresolved { requested: 2 });
    }
}
