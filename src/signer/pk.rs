//! Local private-key signer.

use tracing::debug;

use crate::signer::{cipher, nip04, nip44, SignerError, SignerResult};
use crate::types::nostr::{Event, EventTemplate, Keys, PublicKey};

/// Signs events and handles encrypted payloads with a locally held key.
pub struct PrivateKeySigner {
    keys: Keys,
}

impl PrivateKeySigner {
    /// Accepts hex (zero-left-padded when short) or `nsec1...`.
    pub fn new(input: &str) -> SignerResult<Self> {
        let keys = Keys::parse(input)?;
        Ok(Self { keys })
    }

    pub fn from_keys(keys: Keys) -> Self {
        Self { keys }
    }

    pub fn generate() -> SignerResult<Self> {
        Ok(Self {
            keys: Keys::generate()?,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn sign_event(&self, template: EventTemplate) -> SignerResult<Event> {
        let event = Event::from_template(template, &self.keys)?;
        debug!("[signer] signed event kind={} id={}", event.kind, event.id.to_hex());
        Ok(event)
    }

    pub fn nip04_encrypt(&self, counterparty: &PublicKey, plaintext: &str) -> SignerResult<String> {
        Ok(nip04::encrypt(&self.keys.secret_key, counterparty, plaintext)?)
    }

    pub fn nip04_decrypt(&self, counterparty: &PublicKey, payload: &str) -> SignerResult<String> {
        Ok(nip04::decrypt(&self.keys.secret_key, counterparty, payload)?)
    }

    pub fn nip44_encrypt(&self, counterparty: &PublicKey, plaintext: &str) -> SignerResult<String> {
        let conversation_key =
            nip44::ConversationKey::derive(&self.keys.secret_key, counterparty)?;
        Ok(nip44::encrypt(plaintext, &conversation_key)?)
    }

    pub fn nip44_decrypt(&self, counterparty: &PublicKey, payload: &str) -> SignerResult<String> {
        let conversation_key =
            nip44::ConversationKey::derive(&self.keys.secret_key, counterparty)?;
        Ok(nip44::decrypt(payload, &conversation_key)?)
    }

    /// Decrypt without knowing the envelope format in advance.
    pub fn decrypt(&self, counterparty: &PublicKey, payload: &str) -> SignerResult<String> {
        cipher::decrypt(&self.keys.secret_key, counterparty, payload).map_err(SignerError::from)
    }
}
