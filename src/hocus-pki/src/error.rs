//! Error types for certificate operations.

use thiserror::Error;

/// Error type for all PKI operations.
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed (e.g., insufficient entropy)
    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Invalid key material (bad format, wrong algorithm)
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Signing failed (absent or malformed issuer key, rcgen failure)
    #[error("signing failed: {0}")]
    Signing(String),

    /// X.509 certificate error (parse, SAN, validation)
    #[error("certificate error: {0}")]
    Certificate(String),

    /// PKCS12 bundle assembly error
    #[error("PKCS12 error: {0}")]
    Pkcs12(String),

    /// File system I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for PKI operations.
pub type Result<T> = std::result::Result<T, PkiError>;

impl From<rcgen::Error> for PkiError {
    fn from(e: rcgen::Error) -> Self {
        PkiError::Signing(e.to_string())
    }
}

impl From<rsa::Error> for PkiError {
    fn from(e: rsa::Error) -> Self {
        PkiError::KeyGen(e.to_string())
    }
}
