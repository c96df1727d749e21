//! Error types for the signature engine.
//!
//! This module defines all error types that can occur while signing, timestamping
//! and verifying CMS envelopes.
//!
//! A cryptographic mismatch found during verification is *not* an error: it is
//! reported as [`SecurityLevel::Invalid`](crate::signatures::SecurityLevel::Invalid)
//! on the affected signer inside a normal result.

/// Result type alias for signature engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during signing and verification.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unsupported algorithm or invalid configuration; raised before any I/O
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed or unrecognized DER structure
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// No envelope shape could be recognized in the supplied bytes
    #[error("Unreadable envelope: {0}")]
    UnreadableEnvelope(String),

    /// Failure reported by a timestamp authority or an external signer
    #[error("External service failure: {0}")]
    ExternalService(String),

    /// A signature phase was requested out of protocol order
    #[error("Protocol order violation: expected {expected} phase, found {found}")]
    ProtocolOrder {
        /// Phase the caller asked for
        expected: &'static str,
        /// Phase actually held
        found: &'static str,
    },

    /// Disposition value that is recognized but not implemented
    #[error("Unsupported disposition: {0}")]
    UnsupportedDisposition(String),

    /// Unsupported operation or algorithm combination
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Missing or inconsistent argument (stream, output, chain)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// DER codec error
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error came from a collaborator (signer or timestamp authority).
    pub fn is_external(&self) -> bool {
        matches!(self, Error::ExternalService(_))
    }
}
