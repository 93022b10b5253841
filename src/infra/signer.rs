//! Party signing keys loaded from configuration.

use ed25519_dalek::SigningKey;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;

use crate::domain::{AppError, ConfigError, LedgerError, Signer};

/// Environment variable holding the party keys
pub const SIGNING_KEYS_VAR: &str = "PARTY_SIGNING_KEYS";

/// Decode a base58 ed25519 key, either a 32-byte seed or a 64-byte keypair
pub fn signing_key_from_base58(secret: &SecretString) -> Result<SigningKey, AppError> {
    let key_bytes = bs58::decode(secret.expose_secret().trim())
        .into_vec()
        .map_err(|e| AppError::Ledger(LedgerError::InvalidKey(e.to_string())))?;

    let key_array: [u8; 32] = match key_bytes.len() {
        // keypair format: secret seed first, public key second
        64 => key_bytes[..32].try_into().map_err(|_| {
            AppError::Ledger(LedgerError::InvalidKey("Invalid keypair format".to_string()))
        })?,
        32 => key_bytes.try_into().map_err(|v: Vec<u8>| {
            AppError::Ledger(LedgerError::InvalidKey(format!(
                "Key must be 32 bytes, got {}",
                v.len()
            )))
        })?,
        n => {
            return Err(AppError::Ledger(LedgerError::InvalidKey(format!(
                "Key must be 32 or 64 bytes, got {}",
                n
            ))));
        }
    };

    Ok(SigningKey::from_bytes(&key_array))
}

/// Signers this relayer may act for, keyed by ledger address
#[derive(Debug, Clone, Default)]
pub struct SignerRegistry {
    signers: HashMap<String, Signer>,
}

impl SignerRegistry {
    #[must_use]
    pub fn new(signers: impl IntoIterator<Item = Signer>) -> Self {
        Self {
            signers: signers
                .into_iter()
                .map(|s| (s.address().to_string(), s))
                .collect(),
        }
    }

    /// Parse a comma-separated list of base58 keys; at least one is required
    pub fn from_keys(keys: &SecretString) -> Result<Self, AppError> {
        let signers = keys
            .expose_secret()
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .enumerate()
            .map(|(position, k)| {
                signing_key_from_base58(&SecretString::from(k.to_string()))
                    .map(Signer::new)
                    .map_err(|e| {
                        AppError::Config(ConfigError::Invalid {
                            key: SIGNING_KEYS_VAR.to_string(),
                            message: format!("entry {}: {}", position + 1, e),
                        })
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if signers.is_empty() {
            return Err(AppError::Config(ConfigError::Missing(
                SIGNING_KEYS_VAR.to_string(),
            )));
        }
        Ok(Self::new(signers))
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<&Signer> {
        self.signers.get(address)
    }

    /// Signer for `address`, or an authorization error naming it
    pub fn require(&self, address: &str) -> Result<&Signer, AppError> {
        self.get(address).ok_or_else(|| {
            AppError::Authorization(format!("No signing key configured for {}", address))
        })
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.signers.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.signers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }
}
