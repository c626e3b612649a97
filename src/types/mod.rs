//! Shared protocol types and the error taxonomy they produce.

pub mod nip19;
pub mod nostr;

pub use nip19::Nip19Error;
pub use nostr::{Event, EventId, EventTemplate, Filter, Keys, PublicKey, SecretKey, Timestamp};

/// Errors produced by key normalization and event (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Nip19(#[from] Nip19Error),

    #[error("random generation failed")]
    RandomGenerationFailed,
}

/// Hex-encode `n` freshly generated random bytes.
pub fn random_hex(n: usize) -> Result<String, TypesError> {
    let mut buf = vec![0u8; n];
    getrandom::getrandom(&mut buf).map_err(|_| TypesError::RandomGenerationFailed)?;
    Ok(hex::encode(buf))
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
