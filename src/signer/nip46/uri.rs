//! `nostrconnect://` and `bunker://` URI handling.

use url::Url;

use super::Nip46Error;

fn is_hex_pubkey(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Parse a scheme-prefixed URI into (pubkey, query), reusing the http URL
/// parser for the query string.
fn split_uri(uri: &str, scheme: &str) -> Result<(String, Url), Nip46Error> {
    let rest = uri
        .strip_prefix(scheme)
        .ok_or_else(|| Nip46Error::InvalidUri(format!("expected {scheme} prefix")))?;

    let (pubkey, query) = match rest.split_once('?') {
        Some((pk, q)) => (pk, q),
        None => (rest, ""),
    };
    let pubkey = pubkey.trim_end_matches('/');

    if !is_hex_pubkey(pubkey) {
        return Err(Nip46Error::InvalidUri(
            "pubkey must be 64 hex characters".into(),
        ));
    }

    let parsed = Url::parse(&format!("http://localhost/?{query}"))
        .map_err(|e| Nip46Error::InvalidUri(e.to_string()))?;
    Ok((pubkey.to_string(), parsed))
}

fn query_values(url: &Url, key: &str) -> Vec<String> {
    url.query_pairs()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
        .collect()
}

/// Target parsed from a `bunker://` URI: the remote signer pubkey is
/// known up front and the client initiates the `connect` RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BunkerTarget {
    pub remote_pubkey: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
}

pub fn parse_bunker_uri(uri: &str) -> Result<BunkerTarget, Nip46Error> {
    let (remote_pubkey, url) = split_uri(uri, "bunker://")?;
    let relays = query_values(&url, "relay");
    if relays.is_empty() {
        return Err(Nip46Error::InvalidUri("missing relay parameter".into()));
    }
    let secret = query_values(&url, "secret").into_iter().next();
    Ok(BunkerTarget {
        remote_pubkey,
        relays,
        secret,
    })
}

/// Parameters carried by a `nostrconnect://` URI (client-generated, shown
/// to the signer for discovery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NostrConnectParams {
    pub client_pubkey: String,
    pub relay: String,
    pub secret: Option<String>,
    pub name: Option<String>,
}

pub fn parse_nostrconnect_uri(uri: &str) -> Result<NostrConnectParams, Nip46Error> {
    let (client_pubkey, url) = split_uri(uri, "nostrconnect://")?;
    let relay = query_values(&url, "relay")
        .into_iter()
        .next()
        .ok_or_else(|| Nip46Error::InvalidUri("missing relay parameter".into()))?;
    Ok(NostrConnectParams {
        client_pubkey,
        relay,
        secret: query_values(&url, "secret").into_iter().next(),
        name: query_values(&url, "name").into_iter().next(),
    })
}

fn urlencode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Build the pairing URI handed to the remote signer.
pub fn build_nostrconnect_uri(
    client_pubkey: &str,
    relay: &str,
    secret: &str,
    name: Option<&str>,
) -> String {
    let mut uri = format!(
        "nostrconnect://{client_pubkey}?relay={}&secret={}",
        urlencode(relay),
        urlencode(secret)
    );
    if let Some(name) = name {
        uri.push_str("&name=");
        uri.push_str(&urlencode(name));
    }
    uri
}
