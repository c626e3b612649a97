//! NIP-44 (v2): versioned encrypted payloads.
//!
//! <https://github.com/nostr-protocol/nips/blob/master/44.md>
//!
//! Conversation key is HKDF-extract over the raw ECDH x-coordinate with
//! salt `"nip44-v2"`; per-message keys come from HKDF-expand with the
//! 32-byte nonce. Payload layout: `version || nonce || ciphertext || mac`.

use std::ops::Range;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use getrandom::getrandom;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::nostr::{PublicKey, SecretKey};

const VERSION: u8 = 2;
const MESSAGE_KEYS_SIZE: usize = 76;
const CHACHA_KEY_SIZE: usize = 32;
const CHACHA_NONCE_SIZE: usize = 12;
const CHACHA_KEY_RANGE: Range<usize> = 0..CHACHA_KEY_SIZE;
const CHACHA_NONCE_RANGE: Range<usize> = CHACHA_KEY_SIZE..CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE;
const HMAC_KEY_RANGE: Range<usize> = CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE..MESSAGE_KEYS_SIZE;

const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;

// Decoded payload bounds: 1 version + 32 nonce + 34 min ciphertext + 32 mac
// up to the padded maximum.
const MIN_PAYLOAD_SIZE: usize = 99;
const MAX_PAYLOAD_SIZE: usize = 65603;
const MIN_B64_PAYLOAD_SIZE: usize = 132;
const MAX_B64_PAYLOAD_SIZE: usize = 87472;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Nip44Error {
    #[error("utf-8 decode error")]
    Utf8Decode,

    #[error("invalid length for hkdf")]
    HkdfLength,

    #[error("message empty")]
    MessageEmpty,

    #[error("message too long")]
    MessageTooLong,

    #[error("authentication tag mismatch")]
    TagMismatch,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("invalid payload")]
    InvalidPayload,

    #[error("unknown version: {0}")]
    UnknownVersion(u8),

    #[error("decoding error: {0}")]
    DecodingError(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("random generation failed")]
    RandomGenerationFailed,
}

/// Message keys derived from the conversation key and a nonce.
struct MessageKeys {
    chacha_key: [u8; CHACHA_KEY_SIZE],
    chacha_nonce: [u8; CHACHA_NONCE_SIZE],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    fn derive(conversation_key: &ConversationKey, nonce: &[u8; 32]) -> Result<Self, Nip44Error> {
        let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes())
            .map_err(|_| Nip44Error::HkdfLength)?;

        let mut okm = [0u8; MESSAGE_KEYS_SIZE];
        hk.expand(nonce, &mut okm)
            .map_err(|_| Nip44Error::HkdfLength)?;

        let mut keys = MessageKeys {
            chacha_key: [0u8; CHACHA_KEY_SIZE],
            chacha_nonce: [0u8; CHACHA_NONCE_SIZE],
            hmac_key: [0u8; 32],
        };
        keys.chacha_key.copy_from_slice(&okm[CHACHA_KEY_RANGE]);
        keys.chacha_nonce.copy_from_slice(&okm[CHACHA_NONCE_RANGE]);
        keys.hmac_key.copy_from_slice(&okm[HMAC_KEY_RANGE]);
        Ok(keys)
    }
}

/// NIP-44 v2 conversation key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKey(<sensitive>)")
    }
}

impl ConversationKey {
    #[inline]
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the conversation key from a secret key and a counterparty
    /// public key. Symmetric in its arguments.
    pub fn derive(secret_key: &SecretKey, public_key: &PublicKey) -> Result<Self, Nip44Error> {
        let shared_x = ecdh_shared_secret(secret_key, public_key)?;

        // HKDF-extract with salt="nip44-v2"; the PRK is the conversation key.
        let (prk, _) = Hkdf::<Sha256>::extract(Some(b"nip44-v2"), &shared_x);

        let mut conversation_key = [0u8; 32];
        conversation_key.copy_from_slice(&prk);
        Ok(Self(conversation_key))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// ECDH returning the raw (unhashed) shared x-coordinate.
fn ecdh_shared_secret(
    secret_key: &SecretKey,
    public_key: &PublicKey,
) -> Result<[u8; 32], Nip44Error> {
    use k256::{ecdh::diffie_hellman, PublicKey as K256PublicKey, SecretKey as K256SecretKey};

    let k256_secret = K256SecretKey::from_slice(&secret_key.0)
        .map_err(|e| Nip44Error::InvalidKey(format!("invalid secret key: {e}")))?;

    // x-only public key: recover the point, trying even parity then odd.
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&public_key.0);
    let k256_public = K256PublicKey::from_sec1_bytes(&compressed)
        .or_else(|_| {
            compressed[0] = 0x03;
            K256PublicKey::from_sec1_bytes(&compressed)
        })
        .map_err(|e| Nip44Error::InvalidKey(format!("invalid public key: {e}")))?;

    let shared_secret = diffie_hellman(k256_secret.to_nonzero_scalar(), k256_public.as_affine());

    let mut result = [0u8; 32];
    result.copy_from_slice(shared_secret.raw_secret_bytes());
    Ok(result)
}

/// Padded length for a plaintext of `unpadded_len` bytes.
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }

    let next_power = 1 << ((unpadded_len - 1).ilog2() + 1);
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };

    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    let len = plaintext.len();

    if len < MIN_PLAINTEXT_SIZE {
        return Err(Nip44Error::MessageEmpty);
    }
    if len > MAX_PLAINTEXT_SIZE {
        return Err(Nip44Error::MessageTooLong);
    }

    let padded_len = calc_padded_len(len);
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len, 0);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, Nip44Error> {
    if padded.len() < 2 {
        return Err(Nip44Error::InvalidPadding);
    }

    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 {
        return Err(Nip44Error::MessageEmpty);
    }
    if padded.len() < 2 + unpadded_len || padded.len() != 2 + calc_padded_len(unpadded_len) {
        return Err(Nip44Error::InvalidPadding);
    }

    Ok(padded[2..2 + unpadded_len].to_vec())
}

/// Encrypt to the raw (non-base64) payload.
pub fn encrypt_to_bytes(
    conversation_key: &ConversationKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, Nip44Error> {
    let mut nonce = [0u8; 32];
    getrandom(&mut nonce).map_err(|_| Nip44Error::RandomGenerationFailed)?;
    encrypt_to_bytes_with_nonce(conversation_key, plaintext, &nonce)
}

fn encrypt_to_bytes_with_nonce(
    conversation_key: &ConversationKey,
    plaintext: &[u8],
    nonce: &[u8; 32],
) -> Result<Vec<u8>, Nip44Error> {
    let padded = pad(plaintext)?;
    let keys = MessageKeys::derive(conversation_key, nonce)?;

    let mut ciphertext = padded;
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut ciphertext);

    // MAC over nonce || ciphertext.
    let mut mac = Hmac::<Sha256>::new_from_slice(&keys.hmac_key)
        .map_err(|_| Nip44Error::HkdfLength)?;
    mac.update(nonce);
    mac.update(&ciphertext);
    let mac_bytes = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac_bytes);
    Ok(payload)
}

/// Decrypt a raw (already base64-decoded) payload.
pub fn decrypt_to_bytes(
    conversation_key: &ConversationKey,
    payload: &[u8],
) -> Result<Vec<u8>, Nip44Error> {
    let len = payload.len();
    if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&len) {
        return Err(Nip44Error::InvalidPayload);
    }

    let version = payload[0];
    if version != VERSION {
        return Err(Nip44Error::UnknownVersion(version));
    }

    let nonce = &payload[1..33];
    let ciphertext = &payload[33..len - 32];
    let mac = &payload[len - 32..];

    let nonce_array: [u8; 32] = nonce.try_into().map_err(|_| Nip44Error::InvalidPayload)?;
    let keys = MessageKeys::derive(conversation_key, &nonce_array)?;

    let mut mac_verifier = Hmac::<Sha256>::new_from_slice(&keys.hmac_key)
        .map_err(|_| Nip44Error::HkdfLength)?;
    mac_verifier.update(nonce);
    mac_verifier.update(ciphertext);
    mac_verifier
        .verify_slice(mac)
        .map_err(|_| Nip44Error::TagMismatch)?;

    let mut plaintext_padded = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut plaintext_padded);

    unpad(&plaintext_padded)
}

/// Encrypt a string, returning base64.
pub fn encrypt(plaintext: &str, conversation_key: &ConversationKey) -> Result<String, Nip44Error> {
    let encrypted = encrypt_to_bytes(conversation_key, plaintext.as_bytes())?;
    Ok(BASE64.encode(encrypted))
}

/// Decrypt a base64 payload string.
pub fn decrypt(payload: &str, conversation_key: &ConversationKey) -> Result<String, Nip44Error> {
    // '#' marks a future non-base64 encoding.
    if payload.starts_with('#') {
        return Err(Nip44Error::UnknownVersion(0));
    }

    let plen = payload.len();
    if !(MIN_B64_PAYLOAD_SIZE..=MAX_B64_PAYLOAD_SIZE).contains(&plen) {
        return Err(Nip44Error::InvalidPayload);
    }

    let data = BASE64
        .decode(payload)
        .map_err(|e| Nip44Error::DecodingError(e.to_string()))?;

    let plaintext_bytes = decrypt_to_bytes(conversation_key, &data)?;
    String::from_utf8(plaintext_bytes).map_err(|_| Nip44Error::Utf8Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::nostr::Keys;

    #[test]
    fn test_calc_padded_len() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(64), 64);
        assert_eq!(calc_padded_len(65), 96);
        assert_eq!(calc_padded_len(256), 256);
        assert_eq!(calc_padded_len(257), 320);
    }

    #[test]
    fn test_padding() {
        let plaintext = b"hello";
        let padded = pad(plaintext).unwrap();
        assert_eq!(padded.len(), 2 + 32);
        assert_eq!(padded[0..2], [0x00, 0x05]);
        assert_eq!(&padded[2..7], b"hello");

        let unpadded = unpad(&padded).unwrap();
        assert_eq!(unpadded, plaintext);
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let k1 = ConversationKey::derive(&alice.secret_key, &bob.public_key()).unwrap();
        let k2 = ConversationKey::derive(&bob.secret_key, &alice.public_key()).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let conv = ConversationKey::derive(&alice.secret_key, &bob.public_key()).unwrap();

        for text in ["x", "hello world", "日本語 \u{1F512}", &"long ".repeat(200)] {
            let payload = encrypt(text, &conv).unwrap();
            assert_eq!(decrypt(&payload, &conv).unwrap(), text);
        }
    }

    #[test]
    fn tampered_payload_fails_tag_check() {
        let alice = Keys::generate().unwrap();
        let bob = Keys::generate().unwrap();
        let conv = ConversationKey::derive(&alice.secret_key, &bob.public_key()).unwrap();

        let mut raw = encrypt_to_bytes(&conv, b"secret message padded out to size").unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        assert_eq!(
            decrypt_to_bytes(&conv, &raw).unwrap_err(),
            Nip44Error::TagMismatch
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let conv = ConversationKey::new([1u8; 32]);
        let mut payload = vec![0x01];
        payload.extend_from_slice(&[0u8; 110]);
        assert_eq!(
            decrypt_to_bytes(&conv, &payload).unwrap_err(),
            Nip44Error::UnknownVersion(1)
        );
    }

    #[test]
    fn rejects_empty_message() {
        let conv = ConversationKey::new([1u8; 32]);
        assert_eq!(
            encrypt_to_bytes(&conv, b"").unwrap_err(),
            Nip44Error::MessageEmpty
        );
    }
}
