//! Error types for the Orb protocol core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Orb protocol error types
#[derive(Debug, Error)]
pub enum Error {
    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Canonicalization (RFC 8785) failure
    #[error("canonicalization error: {0}")]
    Canonicalization(String),

    /// Hash mismatch (computed != transmitted)
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Malformed hashlink URI
    #[error("invalid hashlink: {0}")]
    InvalidHashlink(String),

    /// Multibase decoding failure
    #[error("invalid multibase encoding: {0}")]
    Multibase(String),

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Generator profile not present in the registry
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// Witness policy expression could not be parsed
    #[error("policy parse error at offset {pos}: {message}")]
    PolicyParse { pos: usize, message: String },

    /// Revealed key does not hash to the stored commitment
    #[error("commitment mismatch for suffix {0}")]
    CommitmentMismatch(String),

    /// Missing required field
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Semantic validation failure (rejected, never retried)
    #[error("validation error: {0}")]
    Validation(String),
}
