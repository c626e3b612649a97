//! NIP-04: legacy encrypted direct messages.
//!
//! AES-256-CBC with an ECDH shared secret. NIP-04 is deprecated in favor
//! of NIP-44 but remains the broadest common denominator among remote
//! signers, so outbound control messages still use it.

use aes::Aes256;
use base64::engine::{general_purpose, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use getrandom::getrandom;
use k256::{PublicKey as K256PublicKey, SecretKey as K256SecretKey};

use crate::types::nostr::{PublicKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum Nip04Error {
    #[error("invalid content format")]
    InvalidContentFormat,

    #[error("invalid iv: expected 16 bytes, got {0}")]
    InvalidIv(usize),

    #[error("empty ciphertext")]
    EmptyCiphertext,

    #[error("base64 decode error")]
    Base64Decode,

    #[error("utf-8 decode error")]
    Utf8Decode,

    #[error("wrong block mode")]
    WrongBlockMode,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("random generation failed")]
    RandomGenerationFailed,
}

/// Derive the shared AES key via ECDH.
///
/// NIP-04 uses the raw x-coordinate of the shared point directly as the
/// key, without hashing.
fn generate_shared_key(
    secret_key: &SecretKey,
    public_key: &PublicKey,
) -> Result<[u8; 32], Nip04Error> {
    let sk = K256SecretKey::from_bytes((&secret_key.0).into())
        .map_err(|e| Nip04Error::InvalidKey(format!("invalid secret key: {e}")))?;

    // Nostr public keys are x-only; recover the full point by trying the
    // even parity prefix first, then the odd one.
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&public_key.0);
    let pk = K256PublicKey::from_sec1_bytes(&compressed)
        .or_else(|_| {
            compressed[0] = 0x03;
            K256PublicKey::from_sec1_bytes(&compressed)
        })
        .map_err(|e| Nip04Error::InvalidKey(format!("invalid public key: {e}")))?;

    let shared_secret = k256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());

    let mut key = [0u8; 32];
    key.copy_from_slice(shared_secret.raw_secret_bytes());
    Ok(key)
}

fn generate_iv() -> Result<[u8; IV_LEN], Nip04Error> {
    let mut iv = [0u8; IV_LEN];
    getrandom(&mut iv).map_err(|_| Nip04Error::RandomGenerationFailed)?;
    Ok(iv)
}

/// Encrypt `content` into the legacy `base64(ct)?iv=base64(iv)` envelope.
pub fn encrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    content: &str,
) -> Result<String, Nip04Error> {
    encrypt_with_iv(secret_key, public_key, content, generate_iv()?)
}

/// Encrypt with a caller-supplied IV (deterministic, for tests).
pub fn encrypt_with_iv(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    content: &str,
    iv: [u8; IV_LEN],
) -> Result<String, Nip04Error> {
    let key = generate_shared_key(secret_key, public_key)?;

    let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(content.as_bytes());

    Ok(format!(
        "{}?iv={}",
        general_purpose::STANDARD.encode(ciphertext),
        general_purpose::STANDARD.encode(iv)
    ))
}

/// Decrypt the standard `base64(ct)?iv=base64(iv)` form.
pub fn decrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    encrypted_content: &str,
) -> Result<String, Nip04Error> {
    let (ct, iv) = encrypted_content
        .split_once("?iv=")
        .ok_or(Nip04Error::InvalidContentFormat)?;
    decrypt_parts(secret_key, public_key, ct, iv)
}

/// Decrypt from already-separated base64 ciphertext and IV parts.
pub fn decrypt_parts(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    ciphertext_b64: &str,
    iv_b64: &str,
) -> Result<String, Nip04Error> {
    if ciphertext_b64.is_empty() {
        return Err(Nip04Error::EmptyCiphertext);
    }

    let mut encrypted = general_purpose::STANDARD
        .decode(ciphertext_b64)
        .map_err(|_| Nip04Error::Base64Decode)?;
    if encrypted.is_empty() {
        return Err(Nip04Error::EmptyCiphertext);
    }
    let iv = general_purpose::STANDARD
        .decode(iv_b64.trim())
        .map_err(|_| Nip04Error::Base64Decode)?;
    if iv.len() != IV_LEN {
        return Err(Nip04Error::InvalidIv(iv.len()));
    }

    let key = generate_shared_key(secret_key, public_key)?;

    let cipher = Aes256CbcDec::new(&key.into(), iv.as_slice().into());
    let decrypted = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&mut encrypted)
        .map_err(|_| Nip04Error::WrongBlockMode)?;

    String::from_utf8(decrypted).map_err(|_| Nip04Error::Utf8Decode)
}
