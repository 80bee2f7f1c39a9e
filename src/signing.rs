//! Injected signing capability for checkpoints and export indexes.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Something that can produce detached signatures.
///
/// Checkpoint and export signing take this as a dependency rather than
/// reading a process-wide key, so tests can substitute their own.
pub trait Signer: Send + Sync {
    /// Signs `message`, returning the raw signature bytes.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Raw public key bytes matching the signatures.
    fn public_key(&self) -> Vec<u8>;

    /// Algorithm label recorded next to signatures.
    fn algorithm(&self) -> &'static str {
        "ed25519"
    }
}

/// Ed25519 signer.
pub struct Ed25519Signer {
    key: ed25519_dalek::SigningKey,
}

impl Ed25519Signer {
    /// Builds a signer from a 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Builds a signer from a hex-encoded 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signature` if the value is not 64 hex characters.
    pub fn from_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| Error::Signature(format!("invalid hex seed: {e}")))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Signature("ed25519 seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Hex-encoded public key.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.key.sign(message).to_bytes().to_vec()
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().as_bytes().to_vec()
    }
}

/// Verifies an Ed25519 signature. Malformed keys or signatures verify as false.
#[must_use]
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

/// Decodes a hex public key.
///
/// # Errors
///
/// Returns `Error::Signature` if the value is not a valid 32-byte Ed25519 key.
pub fn public_key_from_hex(value: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| Error::Signature(format!("invalid hex public key: {e}")))?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Signature("ed25519 public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&key)?;
    Ok(bytes)
}
