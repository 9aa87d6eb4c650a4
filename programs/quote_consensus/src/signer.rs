use crate::error::EncodeError;
use crate::types::OracleKey;
use crate::verifier::RawOracleResponse;
use crate::wire::{encode_message, QuoteMessage};
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};

/// Oracle-side signing of quote messages.
///
/// Lets simulators and tests produce responses in the exact format the
/// verifier expects. Key custody is the operator's concern.
pub struct QuoteSigner {
    key: SigningKey,
}

impl QuoteSigner {
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// Deterministic key for fixtures: the secret is `SHA-256(seed)`.
    pub fn from_seed(seed: u64) -> Self {
        let secret: [u8; 32] = Sha256::digest(seed.to_le_bytes()).into();
        Self::from_bytes(&secret)
    }

    pub fn oracle_key(&self) -> OracleKey {
        OracleKey::new(self.key.verifying_key().to_bytes())
    }

    pub fn sign_message(&self, message: &QuoteMessage) -> Result<RawOracleResponse, EncodeError> {
        let bytes = encode_message(message)?;
        Ok(self.sign_bytes(bytes))
    }

    /// Sign arbitrary bytes, well-formed or not.
    pub fn sign_bytes(&self, message: Vec<u8>) -> RawOracleResponse {
        let signature = self.key.sign(&message);
        RawOracleResponse {
            oracle: self.oracle_key(),
            signature: signature.to_bytes().to_vec(),
            message,
        }
    }
}
