//! Persisted pairing record and its injectable store.
//!
//! The pairing record is the only state that outlives a single operation.
//! Persistence is abstracted to a `get/set/clear` interface so embedders
//! can back it with whatever key-value mechanism they have.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Fixed key under which the record is stored.
pub const PAIRING_RECORD_KEY: &str = "nostr_pairing";

/// The persisted outcome of a successful NIP-46 pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRecord {
    pub client_private_key: String,
    pub client_pubkey: String,
    pub remote_pubkey: String,
    pub relay: String,
}

impl PairingRecord {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Injectable key-value persistence for the pairing record.
pub trait PairingStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn clear(&self, key: &str);
}

/// In-memory store, used as the default and in tests.
#[derive(Default)]
pub struct MemoryStore {
    value: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PairingStore for MemoryStore {
    fn get(&self, _key: &str) -> Option<String> {
        self.value.read().ok().and_then(|v| v.clone())
    }

    fn set(&self, _key: &str, value: &str) {
        if let Ok(mut guard) = self.value.write() {
            *guard = Some(value.to_string());
        }
    }

    fn clear(&self, _key: &str) {
        if let Ok(mut guard) = self.value.write() {
            *guard = None;
        }
    }
}
