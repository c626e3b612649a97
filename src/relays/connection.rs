//! One subscription over one relay socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::relays::types::{ClientMessage, ConnectionStatus, RelayError, RelayMessage};
use crate::relays::validate_relay_url;
use crate::types::nostr::{Event, Filter};

/// What a connection reports back to its owning query.
#[derive(Debug)]
pub enum ConnEventKind {
    Event(Event),
    /// End of stored events; the connection closes itself right after.
    Eose,
    /// Terminal: the socket is gone for this query.
    Closed,
    /// Terminal: the connection failed. Never aborts sibling relays.
    Error(String),
}

#[derive(Debug)]
pub struct ConnEvent {
    pub relay: String,
    pub kind: ConnEventKind,
}

/// A single subscription over a single WebSocket.
///
/// The connection owns its socket task outright; `abort` tears it down
/// synchronously. Exactly one terminal `Closed`/`Error` is reported per
/// connection.
pub struct RelayConnection {
    url: String,
    status: Arc<RwLock<ConnectionStatus>>,
    task: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect, subscribe and start forwarding frames into `tx`.
    pub fn open(
        url: String,
        sub_id: String,
        filter: Filter,
        tx: UnboundedSender<ConnEvent>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        let status = Arc::new(RwLock::new(ConnectionStatus::Idle));
        let task = tokio::spawn(run(
            url.clone(),
            sub_id,
            filter,
            tx,
            alive,
            status.clone(),
        ));
        Self { url, status, task }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(ConnectionStatus::Failed)
    }

    /// Tear the socket task down. Safe to call more than once.
    pub fn abort(&self) {
        self.task.abort();
        if let Ok(mut status) = self.status.write() {
            if !matches!(*status, ConnectionStatus::Closed | ConnectionStatus::Failed) {
                *status = ConnectionStatus::Closed;
            }
        }
    }
}

fn set_status(status: &Arc<RwLock<ConnectionStatus>>, value: ConnectionStatus) {
    if let Ok(mut guard) = status.write() {
        *guard = value;
    }
}

fn report(tx: &UnboundedSender<ConnEvent>, relay: &str, kind: ConnEventKind) {
    let _ = tx.send(ConnEvent {
        relay: relay.to_string(),
        kind,
    });
}

async fn run(
    url: String,
    sub_id: String,
    filter: Filter,
    tx: UnboundedSender<ConnEvent>,
    alive: Arc<AtomicBool>,
    status: Arc<RwLock<ConnectionStatus>>,
) {
    set_status(&status, ConnectionStatus::Connecting);

    if let Err(e) = validate_relay_url(&url) {
        set_status(&status, ConnectionStatus::Failed);
        report(&tx, &url, ConnEventKind::Error(e.to_string()));
        return;
    }

    let ws = match connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(relay = %url, error = %e, "[relay] connect failed");
            set_status(&status, ConnectionStatus::Failed);
            report(&tx, &url, ConnEventKind::Error(e.to_string()));
            return;
        }
    };
    let (mut sink, mut stream) = ws.split();

    let req = match ClientMessage::req(&sub_id, &filter) {
        Ok(frame) => frame,
        Err(e) => {
            set_status(&status, ConnectionStatus::Failed);
            report(&tx, &url, ConnEventKind::Error(e.to_string()));
            return;
        }
    };
    if let Err(e) = sink.send(Message::Text(req)).await {
        set_status(&status, ConnectionStatus::Failed);
        report(&tx, &url, ConnEventKind::Error(e.to_string()));
        return;
    }
    set_status(&status, ConnectionStatus::Subscribed);
    debug!(relay = %url, sub_id = %sub_id, "[relay] subscribed");

    while let Some(msg) = stream.next().await {
        if !alive.load(Ordering::Acquire) {
            break;
        }
        match msg {
            Ok(Message::Text(text)) => match RelayMessage::parse(&text) {
                Ok(RelayMessage::Event { sub_id: sid, event }) if sid == sub_id => {
                    set_status(&status, ConnectionStatus::Streaming);
                    report(&tx, &url, ConnEventKind::Event(event));
                }
                Ok(RelayMessage::Eose { sub_id: sid }) if sid == sub_id => {
                    // EOSE ends this connection's usefulness for the query.
                    set_status(&status, ConnectionStatus::EoseReceived);
                    report(&tx, &url, ConnEventKind::Eose);
                    if let Ok(close) = ClientMessage::close(&sub_id) {
                        let _ = sink.send(Message::Text(close)).await;
                    }
                    let _ = sink.close().await;
                    break;
                }
                Ok(RelayMessage::Closed { sub_id: sid, message }) if sid == sub_id => {
                    debug!(relay = %url, %message, "[relay] subscription closed by relay");
                    break;
                }
                Ok(RelayMessage::Notice { message }) => {
                    debug!(relay = %url, %message, "[relay] notice");
                }
                Ok(_) => {
                    // OK frames and other-subscription traffic.
                }
                Err(e) => {
                    debug!(relay = %url, error = %e, "[relay] unparseable frame");
                }
            },
            Ok(Message::Ping(data)) => {
                let _ = sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(relay = %url, error = %e, "[relay] socket error");
                set_status(&status, ConnectionStatus::Failed);
                report(&tx, &url, ConnEventKind::Error(e.to_string()));
                return;
            }
        }
    }

    set_status(&status, ConnectionStatus::Closed);
    report(&tx, &url, ConnEventKind::Closed);
}

/// One-shot publish: open a socket, send the event, await its `OK`.
///
/// The caller is expected to wrap this in a timeout.
pub async fn publish(url: &str, event: &Event) -> Result<(bool, String), RelayError> {
    validate_relay_url(url)?;

    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| RelayError::ConnectionError(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let frame = ClientMessage::event(event)?;
    sink.send(Message::Text(frame))
        .await
        .map_err(|e| RelayError::ConnectionError(e.to_string()))?;

    let event_id = event.id.to_hex();
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Ok(RelayMessage::Ok {
                    event_id: id,
                    accepted,
                    message,
                }) = RelayMessage::parse(&text)
                {
                    if id == event_id {
                        let _ = sink.close().await;
                        return Ok((accepted, message));
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = sink.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(RelayError::ConnectionError(e.to_string())),
        }
    }

    Err(RelayError::ConnectionClosed)
}
