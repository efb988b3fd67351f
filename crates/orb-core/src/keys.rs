//! Ed25519 signing keys
//!
//! Provides the service identity keypair used for anchor credential
//! proofs and HTTP signatures.

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use multibase::Base;
use rand::rngs::OsRng;

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic recovery and testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Multibase rendering of the public key, as published in the actor
    /// document's `publicKeyMultibase` field.
    ///
    /// Keys use base58btc (`z`), the Ed25519Signature2020 convention,
    /// while hashlinks use base64url (`u`) to match `did:orb`
    /// identifiers; the two encodings never cross.
    pub fn public_key_multibase(&self) -> String {
        multibase::encode(Base::Base58Btc, self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

/// Verify a signature against a raw public key
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| Error::InvalidSignature)
}

/// Decode a multibase-encoded Ed25519 public key
pub fn decode_public_key_multibase(encoded: &str) -> Result<[u8; 32]> {
    let (_, bytes) = multibase::decode(encoded).map_err(|e| Error::Multibase(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidPublicKey(format!("bad key length in {encoded}")))
}
