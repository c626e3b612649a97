//! Nostr client core.
//!
//! This crate implements the client side of the Nostr protocol:
//!
//! - Key handling: hex/bech32 normalization, generation, x-only public key
//!   derivation (`types`)
//! - Canonical event hashing and BIP-340 signing (`types::nostr`)
//! - Encrypted envelopes: NIP-04 (legacy AES-256-CBC), NIP-44 v2
//!   (ChaCha20 + HMAC-SHA256) and a format-sniffing decrypt dispatcher
//!   (`signer`)
//! - Concurrent multi-relay queries with per-query deduplication and an
//!   exactly-once completion policy (`network`, `relays`)
//! - NIP-46 remote-signer pairing and request/response correlation
//!   (`signer::nip46`)

pub mod network;
pub mod relays;
pub mod signer;
pub mod store;
pub mod telemetry;
pub mod types;

pub use network::{
    open_query, publish_event, CompletionReason, NetworkError, PublishResult, QueryConfig,
    QueryHandle, QueryUpdate,
};
pub use signer::nip46::{Nip46Config, Nip46Error, Nip46Session, SessionState};
pub use signer::{PrivateKeySigner, SignerError};
pub use store::{MemoryStore, PairingRecord, PairingStore};
pub use types::nostr::{Event, EventId, EventTemplate, Filter, Keys, PublicKey, SecretKey};
pub use types::TypesError;
