//! NIP-19: bech32-encoded entities (`nsec`, `npub`).
//!
//! Standard BIP-173 bech32 with the 6-character checksum. Decoding verifies
//! the checksum before regrouping the 5-bit payload back to bytes.

use crate::types::nostr::{PublicKey, SecretKey};

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATOR: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
const CHECKSUM_LEN: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Nip19Error {
    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid character: {0}")]
    InvalidCharacter(char),

    #[error("mixed-case string")]
    MixedCase,

    #[error("invalid length")]
    InvalidLength,

    #[error("invalid padding bits")]
    InvalidPadding,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

fn polymod(values: &[u8]) -> u32 {
    let mut chk: u32 = 1;
    for &v in values {
        let b = chk >> 25;
        chk = (chk & 0x1ff_ffff) << 5 ^ u32::from(v);
        for (i, gen) in GENERATOR.iter().enumerate() {
            if (b >> i) & 1 == 1 {
                chk ^= gen;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hrp.len() * 2 + 1);
    for b in hrp.bytes() {
        out.push(b >> 5);
    }
    out.push(0);
    for b in hrp.bytes() {
        out.push(b & 31);
    }
    out
}

fn create_checksum(hrp: &str, data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; CHECKSUM_LEN]);
    let pm = polymod(&values) ^ 1;
    let mut checksum = [0u8; CHECKSUM_LEN];
    for (i, c) in checksum.iter_mut().enumerate() {
        *c = ((pm >> (5 * (5 - i))) & 31) as u8;
    }
    checksum
}

fn verify_checksum(hrp: &str, data: &[u8]) -> bool {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    polymod(&values) == 1
}

/// Regroup a bit stream from `from` bits per element to `to` bits per
/// element. Encoding pads the tail; decoding rejects non-zero padding.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>, Nip19Error> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv: u32 = (1 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);

    for &value in data {
        if u32::from(value) >> from != 0 {
            return Err(Nip19Error::InvalidPayload("value out of range".into()));
        }
        acc = (acc << from) | u32::from(value);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return Err(Nip19Error::InvalidPadding);
    }

    Ok(out)
}

/// Encode `payload` under the given human-readable prefix.
pub fn encode(hrp: &str, payload: &[u8]) -> Result<String, Nip19Error> {
    if hrp.is_empty() || payload.is_empty() {
        return Err(Nip19Error::InvalidLength);
    }
    let data = convert_bits(payload, 8, 5, true)?;
    let checksum = create_checksum(hrp, &data);

    let mut out = String::with_capacity(hrp.len() + 1 + data.len() + CHECKSUM_LEN);
    out.push_str(hrp);
    out.push('1');
    for d in data.iter().chain(checksum.iter()) {
        out.push(CHARSET[*d as usize] as char);
    }
    Ok(out)
}

/// Decode a bech32 string into its prefix and byte payload.
pub fn decode(s: &str) -> Result<(String, Vec<u8>), Nip19Error> {
    let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(Nip19Error::MixedCase);
    }
    let s = s.to_ascii_lowercase();

    let sep = s.rfind('1').ok_or(Nip19Error::InvalidLength)?;
    if sep == 0 || sep + 1 + CHECKSUM_LEN > s.len() {
        return Err(Nip19Error::InvalidLength);
    }
    let hrp = &s[..sep];

    let mut data = Vec::with_capacity(s.len() - sep - 1);
    for c in s[sep + 1..].chars() {
        let idx = CHARSET
            .iter()
            .position(|&b| b as char == c)
            .ok_or(Nip19Error::InvalidCharacter(c))?;
        data.push(idx as u8);
    }

    if !verify_checksum(hrp, &data) {
        return Err(Nip19Error::ChecksumMismatch);
    }

    let payload = convert_bits(&data[..data.len() - CHECKSUM_LEN], 5, 8, false)?;
    Ok((hrp.to_string(), payload))
}

fn decode_32(s: &str, want_hrp: &str) -> Result<Option<[u8; 32]>, Nip19Error> {
    let (hrp, payload) = decode(s)?;
    if hrp != want_hrp {
        return Ok(None);
    }
    let arr: [u8; 32] = payload
        .try_into()
        .map_err(|_| Nip19Error::InvalidPayload("expected 32-byte payload".into()))?;
    Ok(Some(arr))
}

/// Decode an `nsec1...` string; `None` when the prefix is something else.
pub fn decode_nsec(s: &str) -> Result<Option<SecretKey>, Nip19Error> {
    Ok(decode_32(s, "nsec")?.map(SecretKey))
}

/// Decode an `npub1...` string; `None` when the prefix is something else.
pub fn decode_npub(s: &str) -> Result<Option<PublicKey>, Nip19Error> {
    Ok(decode_32(s, "npub")?.map(PublicKey))
}

pub fn encode_nsec(key: &SecretKey) -> Result<String, Nip19Error> {
    encode("nsec", &key.0)
}

pub fn encode_npub(key: &PublicKey) -> Result<String, Nip19Error> {
    encode("npub", &key.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn known_nsec_vector() {
        let hex_key = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";
        let key = SecretKey::from_hex(hex_key).unwrap();
        let encoded = encode_nsec(&key).unwrap();
        assert_eq!(
            encoded,
            "nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5"
        );
        let decoded = decode_nsec(&encoded).unwrap().unwrap();
        assert_eq!(decoded.to_hex(), hex_key);
    }

    #[test]
    fn known_npub_vector() {
        let pk = PublicKey([0xaa; 32]);
        assert_eq!(
            encode_npub(&pk).unwrap(),
            "npub1424242424242424242424242424242424242424242424242424qamrcaj"
        );
    }

    #[test]
    fn round_trip_arbitrary_payloads() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(19);
        for len in 1..=64usize {
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let encoded = encode("test", &payload).unwrap();
            let (hrp, decoded) = decode(&encoded).unwrap();
            assert_eq!(hrp, "test");
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn flipped_checksum_char_fails() {
        let encoded = encode("nsec", &[0x11; 32]).unwrap();
        // Flipping any one of the six checksum characters must fail.
        for i in encoded.len() - CHECKSUM_LEN..encoded.len() {
            let mut chars: Vec<char> = encoded.chars().collect();
            chars[i] = if chars[i] == 'q' { 'p' } else { 'q' };
            let corrupted: String = chars.into_iter().collect();
            assert_eq!(
                decode(&corrupted),
                Err(Nip19Error::ChecksumMismatch),
                "position {i}"
            );
        }
    }

    #[test]
    fn wrong_prefix_yields_none() {
        let encoded = encode("npub", &[0x22; 32]).unwrap();
        assert!(decode_nsec(&encoded).unwrap().is_none());
    }

    #[test]
    fn mixed_case_rejected() {
        let encoded = encode("nsec", &[0x33; 32]).unwrap();
        let mut chars: Vec<char> = encoded.chars().collect();
        chars[0] = chars[0].to_ascii_uppercase();
        let mixed: String = chars.into_iter().collect();
        assert_eq!(decode(&mixed), Err(Nip19Error::MixedCase));
    }
}
