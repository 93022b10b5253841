//! Explicit signing identity threaded into every state-changing ledger call.

use ed25519_dalek::{Signer as _, SigningKey};

/// A party's signing authority on the token ledger.
///
/// The ledger address is the base58-encoded ed25519 verifying key.
#[derive(Clone)]
pub struct Signer {
    address: String,
    key: SigningKey,
}

impl Signer {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        let address = bs58::encode(key.verifying_key().as_bytes()).into_string();
        Self { address, key }
    }

    /// Ledger address controlled by this signer
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign a message and return the signature as base58
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        bs58::encode(self.key.sign(message).to_bytes()).into_string()
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
