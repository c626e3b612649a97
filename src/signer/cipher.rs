//! Format-sniffing decrypt dispatcher.
//!
//! Inbound ciphertext may be a NIP-44 v2 payload, a legacy NIP-04 envelope
//! in any of its separator spellings, or a JSON `{ciphertext, iv}` object.
//! The format is classified once per message and dispatched by exhaustive
//! match. Outbound encryption always uses the legacy envelope, which the
//! widest population of remote signers accepts.

use base64::engine::{general_purpose, Engine};
use serde_json::Value;

use crate::signer::{nip04, nip44, Nip04Error, Nip44Error};
use crate::types::nostr::{PublicKey, SecretKey};

/// IV separator spellings seen in the wild.
const IV_SEPARATORS: [&str; 3] = ["?iv=", " iv=", "&iv="];

/// Minimum decoded length of a v2 payload.
const MIN_VERSIONED_LEN: usize = 65;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("unknown cipher format")]
    UnknownCipherFormat,

    #[error(transparent)]
    Legacy(#[from] Nip04Error),

    #[error(transparent)]
    Versioned(#[from] Nip44Error),
}

/// The classified wire format of one encrypted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherFormat {
    /// NIP-44 v2: base64 payload whose first decoded byte is the version.
    Versioned,
    /// NIP-04 with an inline IV separator token.
    LegacySeparator(&'static str),
    /// NIP-04 fields wrapped in a JSON object.
    LegacyJson,
    Unknown,
}

/// Classify a ciphertext. The order of checks resolves ambiguity between
/// formats and must not change: a valid versioned payload wins even when
/// the string would also parse as JSON or contains a separator token.
pub fn classify(content: &str) -> CipherFormat {
    if let Ok(decoded) = general_purpose::STANDARD.decode(content) {
        if decoded.len() >= MIN_VERSIONED_LEN && decoded[0] == 0x02 {
            return CipherFormat::Versioned;
        }
    }

    for sep in IV_SEPARATORS {
        if content.contains(sep) {
            return CipherFormat::LegacySeparator(sep);
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(content) {
        if value.get("ciphertext").is_some() && value.get("iv").is_some() {
            return CipherFormat::LegacyJson;
        }
    }

    CipherFormat::Unknown
}

/// Decrypt a message of any recognized format.
pub fn decrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    content: &str,
) -> Result<String, CipherError> {
    match classify(content) {
        CipherFormat::Versioned => {
            let conversation_key = nip44::ConversationKey::derive(secret_key, public_key)?;
            Ok(nip44::decrypt(content, &conversation_key)?)
        }
        CipherFormat::LegacySeparator(sep) => {
            let (ct, iv) = content
                .split_once(sep)
                .ok_or(Nip04Error::InvalidContentFormat)?;
            Ok(nip04::decrypt_parts(secret_key, public_key, ct, iv)?)
        }
        CipherFormat::LegacyJson => {
            let value: Value = serde_json::from_str(content)
                .map_err(|_| Nip04Error::InvalidContentFormat)?;
            let ct = value
                .get("ciphertext")
                .and_then(Value::as_str)
                .ok_or(Nip04Error::InvalidContentFormat)?;
            let iv = value
                .get("iv")
                .and_then(Value::as_str)
                .ok_or(Nip04Error::InvalidContentFormat)?;
            Ok(nip04::decrypt_parts(secret_key, public_key, ct, iv)?)
        }
        CipherFormat::Unknown => Err(CipherError::UnknownCipherFormat),
    }
}

/// Encrypt for the control channel: legacy envelope only.
pub fn encrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    plaintext: &str,
) -> Result<String, CipherError> {
    Ok(nip04::encrypt(secret_key, public_key, plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::nip44::ConversationKey;
    use crate::types::nostr::Keys;

    fn pair() -> (Keys, Keys) {
        (Keys::generate().unwrap(), Keys::generate().unwrap())
    }

    #[test]
    fn classifies_versioned_payload() {
        let mut raw = vec![0x02];
        raw.extend_from_slice(&[0xab; 96]);
        let content = general_purpose::STANDARD.encode(raw);
        assert_eq!(classify(&content), CipherFormat::Versioned);
    }

    #[test]
    fn short_versioned_prefix_is_not_versioned() {
        // First byte 0x02 but below the minimum payload size.
        let content = general_purpose::STANDARD.encode([0x02; 10]);
        assert_eq!(classify(&content), CipherFormat::Unknown);
    }

    #[test]
    fn classifies_separator_variants() {
        assert_eq!(classify("abc?iv=def"), CipherFormat::LegacySeparator("?iv="));
        assert_eq!(classify("abc iv=def"), CipherFormat::LegacySeparator(" iv="));
        assert_eq!(classify("abc&iv=def"), CipherFormat::LegacySeparator("&iv="));
    }

    #[test]
    fn classifies_json_envelope() {
        let content = r#"{"ciphertext":"abc","iv":"def"}"#;
        assert_eq!(classify(content), CipherFormat::LegacyJson);
        // JSON without both fields stays unknown.
        assert_eq!(classify(r#"{"ciphertext":"abc"}"#), CipherFormat::Unknown);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(classify("not encrypted at all"), CipherFormat::Unknown);
        assert_eq!(classify(""), CipherFormat::Unknown);
    }

    #[test]
    fn versioned_beats_json_shape() {
        // A base64 buffer decoding to 0x02... wins over any other reading
        // of the same string.
        let mut raw = vec![0x02];
        raw.extend_from_slice(&[0x11; 96]);
        let content = general_purpose::STANDARD.encode(raw);
        assert!(serde_json::from_str::<Value>(&format!("\"{content}\"")).is_ok());
        assert_eq!(classify(&content), CipherFormat::Versioned);
    }

    #[test]
    fn decrypt_routes_versioned() {
        let (alice, bob) = pair();
        let conv = ConversationKey::derive(&alice.secret_key, &bob.public_key()).unwrap();
        let payload = nip44::encrypt("versioned message", &conv).unwrap();
        let plain = decrypt(&bob.secret_key, &alice.public_key(), &payload).unwrap();
        assert_eq!(plain, "versioned message");
    }

    #[test]
    fn decrypt_routes_legacy() {
        let (alice, bob) = pair();
        let payload = encrypt(&alice.secret_key, &bob.public_key(), "legacy message").unwrap();
        assert!(matches!(classify(&payload), CipherFormat::LegacySeparator("?iv=")));
        let plain = decrypt(&bob.secret_key, &alice.public_key(), &payload).unwrap();
        assert_eq!(plain, "legacy message");
    }

    #[test]
    fn decrypt_routes_json_envelope() {
        let (alice, bob) = pair();
        let payload = encrypt(&alice.secret_key, &bob.public_key(), "json form").unwrap();
        let (ct, iv) = payload.split_once("?iv=").unwrap();
        let json = serde_json::json!({ "ciphertext": ct, "iv": iv }).to_string();
        let plain = decrypt(&bob.secret_key, &alice.public_key(), &json).unwrap();
        assert_eq!(plain, "json form");
    }

    #[test]
    fn unknown_format_errors() {
        let (alice, bob) = pair();
        let err = decrypt(&bob.secret_key, &alice.public_key(), "plain text").unwrap_err();
        assert!(matches!(err, CipherError::UnknownCipherFormat));
    }

    #[test]
    fn legacy_round_trip_utf8() {
        let (alice, bob) = pair();
        for text in ["", "höhe \u{1F680}", "multi\nline"] {
            let payload = encrypt(&alice.secret_key, &bob.public_key(), text).unwrap();
            assert_eq!(
                decrypt(&bob.secret_key, &alice.public_key(), &payload).unwrap(),
                text
            );
        }
    }
}
