//! Session tunables.

use std::time::Duration;

/// Window in which the remote signer must acknowledge the pairing.
pub const DEFAULT_PAIRING_TIMEOUT: Duration = Duration::from_secs(120);

/// Window in which the remote signer must answer a request.
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(60);

/// Subscriptions for responses start this many seconds in the past to
/// tolerate clock skew between us and the relay.
pub const CLOCK_SKEW_ALLOWANCE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct Nip46Config {
    pub pairing_timeout: Duration,
    pub signing_timeout: Duration,
    pub clock_skew_allowance_secs: u64,
}

impl Default for Nip46Config {
    fn default() -> Self {
        Self {
            pairing_timeout: DEFAULT_PAIRING_TIMEOUT,
            signing_timeout: DEFAULT_SIGNING_TIMEOUT,
            clock_skew_allowance_secs: CLOCK_SKEW_ALLOWANCE_SECS,
        }
    }
}
