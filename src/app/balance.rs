//! Pre-flight balance verification against the token ledger.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::{AppError, BalanceCheck, LedgerClient, Shortfall, TokenId};

/// Checks that a holder owns enough of every token before a transfer
pub struct BalanceVerifier {
    ledger: Arc<dyn LedgerClient>,
}

impl BalanceVerifier {
    #[must_use]
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }

    /// Verify `(token_id, amount)` requirements for `holder`.
    ///
    /// Amounts for repeated ids are summed. A shortfall is a normal result;
    /// only ledger query failures are errors.
    #[instrument(skip(self, requirements), fields(holder = %holder, tokens = requirements.len()))]
    pub async fn verify(
        &self,
        holder: &str,
        requirements: &[(TokenId, u64)],
    ) -> Result<BalanceCheck, AppError> {
        let mut needed: BTreeMap<TokenId, u128> = BTreeMap::new();
        for (token_id, amount) in requirements {
            *needed.entry(*token_id).or_default() += u128::from(*amount);
        }

        let mut shortfalls = Vec::new();
        for (token_id, amount) in needed {
            let held = self.ledger.balance_of(holder, token_id).await?;
            if held < amount {
                debug!(token_id, held, needed = amount, "Balance shortfall");
                shortfalls.push(Shortfall {
                    token_id,
                    held: held.to_string(),
                    needed: amount.to_string(),
                });
            }
        }

        Ok(BalanceCheck {
            can_transfer: shortfalls.is_empty(),
            shortfalls,
        })
    }

    /// Verify one unit of each token
    pub async fn verify_units(
        &self,
        holder: &str,
        token_ids: &[TokenId],
    ) -> Result<BalanceCheck, AppError> {
        let requirements: Vec<(TokenId, u64)> = token_ids.iter().map(|id| (*id, 1)).collect();
        self.verify(holder, &requirements).await
    }
}
