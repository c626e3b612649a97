//! Signing and encryption.
//!
//! `PrivateKeySigner` is the local-key signer; `nip46` provides the
//! remote-signer session. Both encrypt through the same envelope code:
//! `nip04` (legacy), `nip44` (versioned) and the format-sniffing
//! dispatcher in `cipher`.

pub mod cipher;
pub mod nip04;
pub mod nip44;
pub mod nip46;
pub mod pk;

pub use cipher::{CipherError, CipherFormat};
pub use nip04::Nip04Error;
pub use nip44::Nip44Error;
pub use pk::PrivateKeySigner;

use crate::types::TypesError;

/// Errors produced by signing operations.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid private key format: {0}")]
    InvalidPrivateKey(String),

    #[error("cryptographic operation failed: {0}")]
    CryptoError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl From<Nip04Error> for SignerError {
    fn from(e: Nip04Error) -> Self {
        SignerError::CryptoError(e.to_string())
    }
}

impl From<Nip44Error> for SignerError {
    fn from(e: Nip44Error) -> Self {
        SignerError::CryptoError(e.to_string())
    }
}

impl From<TypesError> for SignerError {
    fn from(e: TypesError) -> Self {
        match e {
            TypesError::InvalidKeyFormat(msg) => SignerError::InvalidPrivateKey(msg),
            other => SignerError::CryptoError(other.to_string()),
        }
    }
}

pub type SignerResult<T> = Result<T, SignerError>;
