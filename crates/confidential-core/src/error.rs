//! Error types for the confidentiality layer

use thiserror::Error;

/// Result type alias for confidentiality layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding, executing or reconstructing
/// confidential requests
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Threshold requirements not met
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Malformed or truncated wire bytes
    #[error("Decode error: {0}")]
    Decode(String),

    /// A wire tag that does not name any known variant
    #[error("Unknown {kind} tag: {tag}")]
    UnknownTag { kind: &'static str, tag: u8 },

    /// Share, commitment or proposal verification failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Encryption, decryption or combination failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// No key material or shareholder registered for a process
    #[error("Unknown process: {0}")]
    UnknownProcess(u32),

    /// Inter-server transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reconfiguration could not be staged or executed
    #[error("Reconfiguration error: {0}")]
    Reconfiguration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

