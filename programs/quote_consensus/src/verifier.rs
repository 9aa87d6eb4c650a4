//! Signature verifier
//!
//! Authenticates raw oracle responses against the consumer's queue. Nothing
//! here touches shared state: a bad response is turned into a typed error and
//! the caller carries on with the rest of the batch.
//!
//! Checks run cheapest first:
//! 1. envelope: 64-byte signature, message length within the wire limits
//! 2. the signer is a member of the queue
//! 3. strict Ed25519 verification over the message bytes
//! 4. the message header names the same queue

use crate::error::{DropReason, VerificationError};
use crate::pipeline::{Dropped, Stage};
use crate::queue::Queue;
use crate::types::OracleKey;
use crate::wire::{self, HEADER_LEN, MAX_MESSAGE_LEN};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const SIGNATURE_LEN: usize = 64;

/// A signed payload from one oracle, exactly as received from the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawOracleResponse {
    pub oracle: OracleKey,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub message: Vec<u8>,
}

/// Message bytes whose signer has been authenticated against a queue.
///
/// Only [`SignatureVerifier`] can build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedResponse {
    oracle: OracleKey,
    message: Vec<u8>,
}

impl VerifiedResponse {
    pub fn oracle(&self) -> OracleKey {
        self.oracle
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

/// Authenticates raw oracle responses against the consumer's queue.
///
/// Stateless: the queue passed to each call is the whole trust root.
pub struct SignatureVerifier;

impl SignatureVerifier {
    /// Check one response and, if it passes, hand back its message bytes
    /// tagged with the authenticated signer.
    ///
    /// # Errors
    /// * `MalformedMessage` - signature not 64 bytes, message length outside
    ///   the header/maximum range, or no queue in the header
    /// * `UnauthorizedSigner` - the signer is not a member of `queue`
    /// * `InvalidSignature` - unparseable key or failed strict Ed25519 check
    /// * `QueueMismatch` - the message was signed for another queue
    pub fn verify(
        response: &RawOracleResponse,
        queue: &Queue,
    ) -> Result<VerifiedResponse, VerificationError> {
        let signature: [u8; SIGNATURE_LEN] =
            response.signature.as_slice().try_into().map_err(|_| {
                VerificationError::MalformedMessage(format!(
                    "signature is {} bytes, expected {SIGNATURE_LEN}",
                    response.signature.len()
                ))
            })?;

        let len = response.message.len();
        if !(HEADER_LEN..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(VerificationError::MalformedMessage(format!(
                "message is {len} bytes, expected {HEADER_LEN}..={MAX_MESSAGE_LEN}"
            )));
        }

        if !queue.is_member(&response.oracle) {
            return Err(VerificationError::UnauthorizedSigner {
                oracle: response.oracle,
                queue: queue.id,
            });
        }

        let invalid = || VerificationError::InvalidSignature {
            oracle: response.oracle,
        };
        let verifying_key =
            VerifyingKey::from_bytes(response.oracle.as_bytes()).map_err(|_| invalid())?;
        verifying_key
            .verify_strict(&response.message, &Signature::from_bytes(&signature))
            .map_err(|_| invalid())?;

        let signed_for = wire::signed_queue(&response.message).ok_or_else(|| {
            VerificationError::MalformedMessage("missing queue in header".to_string())
        })?;
        if signed_for != queue.id {
            return Err(VerificationError::QueueMismatch {
                signed_for,
                expected: queue.id,
            });
        }

        Ok(VerifiedResponse {
            oracle: response.oracle,
            message: response.message.clone(),
        })
    }

    /// Verify every response, splitting the batch into survivors and drops.
    ///
    /// # Errors
    /// Never fails as a whole: each failing response becomes a [`Dropped`]
    /// entry at [`Stage::Received`] carrying its `VerificationError`.
    pub fn verify_batch(
        responses: &[RawOracleResponse],
        queue: &Queue,
    ) -> (Vec<VerifiedResponse>, Vec<Dropped>) {
        let mut verified = Vec::with_capacity(responses.len());
        let mut dropped = Vec::new();

        for response in responses {
            match Self::verify(response, queue) {
                Ok(v) => {
                    debug!(oracle = %response.oracle, "signature verified");
                    verified.push(v);
                }
                Err(e) => {
                    warn!(oracle = %response.oracle, error = %e, "dropping response");
                    dropped.push(Dropped {
                        oracle: response.oracle,
                        feed_id: None,
                        stage: Stage::Received,
                        reason: DropReason::Verification(e),
                    });
                }
            }
        }

        (verified, dropped)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(serde::de::Error::custom)
    }
}
