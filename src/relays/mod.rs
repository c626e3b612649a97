//! Relay connections (NIP-01).
//!
//! One `RelayConnection` drives exactly one subscription over one
//! WebSocket. Aggregation across relays lives in `crate::network`.

pub mod connection;
pub mod types;

pub use connection::{ConnEvent, ConnEventKind, RelayConnection};
pub use types::{ClientMessage, ConnectionStatus, RelayError, RelayMessage};

/// Validate a relay URL before attempting a connection.
pub fn validate_relay_url(url: &str) -> Result<(), RelayError> {
    if url.is_empty() {
        return Err(RelayError::InvalidUrl("url cannot be empty".to_string()));
    }

    if !url.starts_with("ws://") && !url.starts_with("wss://") {
        return Err(RelayError::InvalidUrl(
            "url must start with ws:// or wss://".to_string(),
        ));
    }

    Ok(())
}

/// Normalize a relay URL: trim, lowercase, drop a trailing slash.
pub fn normalize_relay_url(url: &str) -> String {
    let mut normalized = url.trim().to_lowercase();
    if normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }
    normalized
}
