//! NIP-46 remote signing ("nostrconnect" / "bunker").
//!
//! A session owns an ephemeral client keypair and talks to the remote
//! signer over kind-24133 control events on one relay. Pairing is a
//! state machine with a hard timeout; requests are correlated to
//! responses by RPC id. Control payloads are encrypted with the legacy
//! envelope outbound and sniffed inbound, since signer implementations
//! vary.

pub mod config;
pub mod uri;

pub use config::Nip46Config;
pub use uri::{BunkerTarget, NostrConnectParams};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::relays::connection::{publish, ConnEvent, ConnEventKind, RelayConnection};
use crate::relays::RelayError;
use crate::signer::{cipher, CipherError, SignerError};
use crate::store::{PairingRecord, PairingStore, PAIRING_RECORD_KEY};
use crate::types::nostr::{kinds, Event, EventTemplate, Filter, Keys, PublicKey, SecretKey};
use crate::types::{random_hex, unix_now, TypesError};

#[derive(Debug, thiserror::Error)]
pub enum Nip46Error {
    #[error("pairing timed out")]
    PairingTimeout,

    #[error("signing timed out")]
    SigningTimeout,

    #[error("signing rejected: {0}")]
    SigningRejected(String),

    #[error("session is not paired")]
    NotPaired,

    #[error("session is closed")]
    SessionClosed,

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Signer(#[from] SignerError),

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl From<CipherError> for Nip46Error {
    fn from(e: CipherError) -> Self {
        Nip46Error::Signer(SignerError::Cipher(e))
    }
}

/// Session lifecycle. `TimedOut` and `Closed` are terminal; a timed-out
/// session's secret must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Listening,
    Paired,
    AwaitingResponse,
    Idle,
    TimedOut,
    Closed,
}

/// Permissive connect-acknowledgement classifier.
///
/// Heterogeneous signer implementations answer the pairing in different
/// shapes, so any of these counts. The looseness is deliberate and must
/// not be tightened.
fn is_connect_ack(rpc: &Value, secret: &str) -> bool {
    let result = rpc.get("result");
    let error_present = rpc.get("error").map(|v| !v.is_null()).unwrap_or(false);

    if let Some(s) = result.and_then(Value::as_str) {
        if s == "ack" || s == secret {
            return true;
        }
    }
    if rpc.get("method").and_then(Value::as_str) == Some("connect") {
        return true;
    }
    if result.is_some() && !error_present {
        return true;
    }
    rpc.get("id").is_some() && result.is_some()
}

/// Whether a control event carries a `p` tag naming `client_pubkey_hex`.
fn addressed_to(event: &Event, client_pubkey_hex: &str) -> bool {
    event.tags.iter().any(|tag| {
        tag.first().map(String::as_str) == Some("p")
            && tag.get(1).map(String::as_str) == Some(client_pubkey_hex)
    })
}

/// Decrypt and parse one control event. `None` swallows anything
/// malformed; a single bad message never aborts the session.
fn decode_control_event(
    event: &Event,
    secret_key: &SecretKey,
    client_pubkey_hex: &str,
) -> Option<Value> {
    if event.kind != kinds::NOSTR_CONNECT {
        debug!("[nip46] ignoring event kind {}", event.kind);
        return None;
    }
    if !addressed_to(event, client_pubkey_hex) {
        debug!("[nip46] event not addressed to us");
        return None;
    }

    let plaintext = match cipher::decrypt(secret_key, &event.pubkey, &event.content) {
        Ok(pt) => pt,
        Err(e) => {
            warn!("[nip46] decryption failed: {}", e);
            return None;
        }
    };
    match serde_json::from_str::<Value>(&plaintext) {
        Ok(rpc) => Some(rpc),
        Err(e) => {
            warn!("[nip46] unparseable rpc payload: {}", e);
            None
        }
    }
}

/// Wait for the first event classifying as a connect acknowledgement.
/// Returns the remote signer's pubkey hex.
async fn await_ack(
    rx: &mut UnboundedReceiver<ConnEvent>,
    secret_key: &SecretKey,
    client_pubkey_hex: &str,
    secret: &str,
    timeout: std::time::Duration,
) -> Result<String, Nip46Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let received = match timeout_at(deadline, rx.recv()).await {
            Err(_) => return Err(Nip46Error::PairingTimeout),
            Ok(None) => {
                // Connection gone; nothing more can arrive but the
                // contract is one timeout callback per attempt.
                sleep_until(deadline).await;
                return Err(Nip46Error::PairingTimeout);
            }
            Ok(Some(received)) => received,
        };

        let ConnEventKind::Event(event) = received.kind else {
            continue;
        };
        let Some(rpc) = decode_control_event(&event, secret_key, client_pubkey_hex) else {
            continue;
        };

        if is_connect_ack(&rpc, secret) {
            let remote = event.pubkey.to_hex();
            info!("[nip46] remote signer discovered: {}", remote);
            return Ok(remote);
        }
        debug!("[nip46] control message is not a connect ack");
    }
}

/// Wait for the response whose RPC `id` matches `request_id`; responses
/// with any other id are ignored.
async fn await_response(
    rx: &mut UnboundedReceiver<ConnEvent>,
    secret_key: &SecretKey,
    client_pubkey_hex: &str,
    request_id: &str,
    timeout: std::time::Duration,
) -> Result<Value, Nip46Error> {
    let deadline = Instant::now() + timeout;
    loop {
        let received = match timeout_at(deadline, rx.recv()).await {
            Err(_) => return Err(Nip46Error::SigningTimeout),
            Ok(None) => {
                sleep_until(deadline).await;
                return Err(Nip46Error::SigningTimeout);
            }
            Ok(Some(received)) => received,
        };

        let ConnEventKind::Event(event) = received.kind else {
            continue;
        };
        let Some(rpc) = decode_control_event(&event, secret_key, client_pubkey_hex) else {
            continue;
        };

        if rpc.get("id").and_then(Value::as_str) != Some(request_id) {
            debug!("[nip46] response id mismatch, ignoring");
            continue;
        }

        if let Some(error) = rpc.get("error").filter(|v| !v.is_null()) {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(Nip46Error::SigningRejected(message));
        }
        if let Some(result) = rpc.get("result") {
            return Ok(result.clone());
        }
        debug!("[nip46] correlated response without result, ignoring");
    }
}

/// A remote-signer session.
///
/// Created per login attempt. On pairing success the session persists a
/// `PairingRecord`; on timeout it is terminal and the caller must mint a
/// new session with a fresh keypair and secret.
pub struct Nip46Session {
    relay_url: String,
    app_name: Option<String>,
    client_keys: Keys,
    secret: String,
    remote_pubkey: Option<String>,
    state: SessionState,
    config: Nip46Config,
    store: Arc<dyn PairingStore>,
}

impl Nip46Session {
    /// Fresh session for the QR ("nostrconnect") flow: ephemeral keypair
    /// and random secret.
    pub fn new(
        relay_url: impl Into<String>,
        app_name: Option<String>,
        store: Arc<dyn PairingStore>,
    ) -> Result<Self, Nip46Error> {
        Ok(Self {
            relay_url: relay_url.into(),
            app_name,
            client_keys: Keys::generate()?,
            secret: random_hex(16)?,
            remote_pubkey: None,
            state: SessionState::Created,
            config: Nip46Config::default(),
            store,
        })
    }

    /// Session for the `bunker://` flow: remote pubkey known up front,
    /// pairing is initiated by us via the `connect` RPC.
    pub fn from_bunker(
        target: &BunkerTarget,
        app_name: Option<String>,
        store: Arc<dyn PairingStore>,
    ) -> Result<Self, Nip46Error> {
        let relay_url = target
            .relays
            .first()
            .cloned()
            .ok_or_else(|| Nip46Error::InvalidUri("bunker target has no relay".into()))?;
        Ok(Self {
            relay_url,
            app_name,
            client_keys: Keys::generate()?,
            secret: target.secret.clone().unwrap_or_default(),
            remote_pubkey: Some(target.remote_pubkey.clone()),
            state: SessionState::Created,
            config: Nip46Config::default(),
            store,
        })
    }

    /// Rebuild a paired session from the persisted record, if any.
    pub fn resume(store: Arc<dyn PairingStore>) -> Result<Option<Self>, Nip46Error> {
        let Some(raw) = store.get(PAIRING_RECORD_KEY) else {
            return Ok(None);
        };
        let record = PairingRecord::from_json(&raw).map_err(SignerError::from)?;
        let client_keys = Keys::parse(&record.client_private_key)?;
        Ok(Some(Self {
            relay_url: record.relay,
            app_name: None,
            client_keys,
            secret: String::new(),
            remote_pubkey: Some(record.remote_pubkey),
            state: SessionState::Idle,
            config: Nip46Config::default(),
            store,
        }))
    }

    pub fn with_config(mut self, config: Nip46Config) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_pubkey(&self) -> PublicKey {
        self.client_keys.public_key()
    }

    pub fn remote_pubkey(&self) -> Option<&str> {
        self.remote_pubkey.as_deref()
    }

    /// The URI shown to the remote signer for discovery.
    pub fn pairing_uri(&self) -> String {
        uri::build_nostrconnect_uri(
            &self.client_keys.public_key().to_hex(),
            &self.relay_url,
            &self.secret,
            self.app_name.as_deref(),
        )
    }

    fn control_filter(&self, since: Option<u64>) -> Filter {
        let mut filter = Filter::new()
            .kinds([kinds::NOSTR_CONNECT])
            .p_tag(self.client_keys.public_key().to_hex());
        if let Some(since) = since {
            filter = filter.since(since);
        }
        filter
    }

    fn persist_pairing(&self, remote_pubkey: &str) -> Result<(), Nip46Error> {
        let record = PairingRecord {
            client_private_key: self.client_keys.secret_key.to_hex(),
            client_pubkey: self.client_keys.public_key().to_hex(),
            remote_pubkey: remote_pubkey.to_string(),
            relay: self.relay_url.clone(),
        };
        let json = record.to_json().map_err(SignerError::from)?;
        self.store.set(PAIRING_RECORD_KEY, &json);
        Ok(())
    }

    /// Listen for the signer's connect acknowledgement (QR flow).
    ///
    /// Transitions to `Paired` and returns the remote pubkey, or to
    /// `TimedOut` after the pairing window with no acknowledgement.
    pub async fn listen(&mut self) -> Result<String, Nip46Error> {
        if matches!(self.state, SessionState::TimedOut | SessionState::Closed) {
            return Err(Nip46Error::SessionClosed);
        }
        self.state = SessionState::Listening;

        let alive = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = RelayConnection::open(
            self.relay_url.clone(),
            random_hex(16)?,
            self.control_filter(None),
            tx,
            alive.clone(),
        );

        let outcome = await_ack(
            &mut rx,
            &self.client_keys.secret_key,
            &self.client_keys.public_key().to_hex(),
            &self.secret,
            self.config.pairing_timeout,
        )
        .await;

        alive.store(false, Ordering::Release);
        connection.abort();

        match outcome {
            Ok(remote) => {
                self.persist_pairing(&remote)?;
                self.remote_pubkey = Some(remote.clone());
                self.state = SessionState::Paired;
                Ok(remote)
            }
            Err(e) => {
                self.state = SessionState::TimedOut;
                Err(e)
            }
        }
    }

    /// Initiate pairing for the bunker flow by sending `connect`.
    pub async fn connect(&mut self) -> Result<String, Nip46Error> {
        let remote = self
            .remote_pubkey
            .clone()
            .ok_or(Nip46Error::NotPaired)?;
        let params = vec![json!(remote), json!(self.secret)];
        match self.rpc_request("connect", params).await {
            Ok(_) => {
                self.persist_pairing(&remote)?;
                self.state = SessionState::Paired;
                Ok(remote)
            }
            Err(Nip46Error::SigningTimeout) => {
                self.state = SessionState::TimedOut;
                Err(Nip46Error::PairingTimeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the remote signer to sign an event template.
    pub async fn sign_event(&mut self, template: EventTemplate) -> Result<Event, Nip46Error> {
        let unsigned = json!({
            "kind": template.kind,
            "content": template.content,
            "tags": template.tags,
            "created_at": unix_now(),
        });
        let params = vec![json!(unsigned.to_string())];
        let result = self.rpc_request("sign_event", params).await?;

        let event = match result {
            Value::String(s) => Event::from_json(&s).map_err(SignerError::from)?,
            other => serde_json::from_value::<Event>(other)
                .map_err(|e| Nip46Error::UnexpectedResponse(e.to_string()))?,
        };
        Ok(event)
    }

    /// Ask the remote signer for its user pubkey.
    pub async fn get_public_key(&mut self) -> Result<String, Nip46Error> {
        let result = self.rpc_request("get_public_key", vec![]).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Nip46Error::UnexpectedResponse("pubkey is not a string".into()))
    }

    /// One encrypted RPC round trip over a fresh control subscription.
    async fn rpc_request(&mut self, method: &str, params: Vec<Value>) -> Result<Value, Nip46Error> {
        if matches!(self.state, SessionState::TimedOut | SessionState::Closed) {
            return Err(Nip46Error::SessionClosed);
        }
        let remote_hex = self.remote_pubkey.clone().ok_or(Nip46Error::NotPaired)?;
        let remote_pubkey = PublicKey::from_hex(&remote_hex).map_err(SignerError::from)?;

        self.state = SessionState::AwaitingResponse;

        // Subscribe slightly in the past so a fast answer is not missed.
        let since = unix_now().saturating_sub(self.config.clock_skew_allowance_secs);
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = RelayConnection::open(
            self.relay_url.clone(),
            random_hex(16)?,
            self.control_filter(Some(since)),
            tx,
            alive.clone(),
        );

        let outcome = self
            .send_and_await(method, params, &remote_hex, &remote_pubkey, &mut rx)
            .await;

        alive.store(false, Ordering::Release);
        connection.abort();
        self.state = SessionState::Idle;
        outcome
    }

    async fn send_and_await(
        &self,
        method: &str,
        params: Vec<Value>,
        remote_hex: &str,
        remote_pubkey: &PublicKey,
        rx: &mut UnboundedReceiver<ConnEvent>,
    ) -> Result<Value, Nip46Error> {
        let request_id = random_hex(8)?;
        let rpc = json!({
            "id": request_id,
            "method": method,
            "params": params,
        });

        // Legacy envelope outbound for broadest signer compatibility.
        let ciphertext =
            cipher::encrypt(&self.client_keys.secret_key, remote_pubkey, &rpc.to_string())?;

        let mut tags = vec![vec!["p".to_string(), remote_hex.to_string()]];
        if let Some(app) = &self.app_name {
            tags.push(vec!["client".to_string(), app.clone()]);
        }
        let event = Event::from_template(
            EventTemplate::new(kinds::NOSTR_CONNECT, ciphertext, tags),
            &self.client_keys,
        )?;

        match tokio::time::timeout(
            self.config.signing_timeout,
            publish(&self.relay_url, &event),
        )
        .await
        {
            Ok(Ok((accepted, message))) => {
                if !accepted {
                    debug!("[nip46] relay did not accept request event: {}", message);
                }
            }
            Ok(Err(e)) => return Err(Nip46Error::Relay(e)),
            Err(_) => return Err(Nip46Error::SigningTimeout),
        }

        await_response(
            rx,
            &self.client_keys.secret_key,
            &self.client_keys.public_key().to_hex(),
            &request_id,
            self.config.signing_timeout,
        )
        .await
    }

    /// Terminal close. Keeps the persisted record.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Terminal close that also forgets the pairing record.
    pub fn unpair(&mut self) {
        self.store.clear(PAIRING_RECORD_KEY);
        self.remote_pubkey = None;
        self.state = SessionState::Closed;
    }
}
