//! Multi-relay query aggregation.
//!
//! One logical query fans out over N relay connections which all feed one
//! channel. The aggregator deduplicates by event id and completes exactly
//! once, on the first of: every connection closed or errored, the hard
//! timeout, or the early-settle timer. Per-relay failures only count
//! toward the all-closed condition and never abort sibling relays.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::relays::connection::{publish, ConnEvent, ConnEventKind, RelayConnection};
use crate::relays::{normalize_relay_url, validate_relay_url, RelayError};
use crate::types::nostr::{Event, Filter};
use crate::types::{random_hex, TypesError};

pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(750);
const IDLE_TIMER: Duration = Duration::from_secs(86_400);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("no valid relays")]
    NoRelays,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Types(#[from] TypesError),
}

/// Per-query tunables.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    /// Upper bound on the whole query.
    pub hard_timeout: Duration,
    /// Early-settle delay, armed on the first delivered event.
    pub settle_delay: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            hard_timeout: DEFAULT_HARD_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Why a query completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    AllClosed,
    HardTimeout,
    EarlySettle,
}

/// What a query streams to its caller: events first, then exactly one
/// completion.
#[derive(Debug)]
pub enum QueryUpdate {
    Event(Event),
    Complete(CompletionReason),
}

/// Outcome of publishing to one relay.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub relay: String,
    pub accepted: bool,
    pub message: String,
}

/// Handle to one in-flight query. Dropping it does not cancel the query;
/// call `cancel` for synchronous teardown.
pub struct QueryHandle {
    updates: UnboundedReceiver<QueryUpdate>,
    alive: Arc<AtomicBool>,
    latch: Arc<AtomicBool>,
    connections: Arc<Vec<RelayConnection>>,
    aggregator: JoinHandle<()>,
}

impl QueryHandle {
    pub async fn next_update(&mut self) -> Option<QueryUpdate> {
        self.updates.recv().await
    }

    /// Synchronously close every socket and timer owned by this query.
    /// Any late trigger becomes a no-op.
    pub fn cancel(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.latch.store(true, Ordering::Release);
        for connection in self.connections.iter() {
            connection.abort();
        }
        self.aggregator.abort();
    }
}

impl Stream for QueryHandle {
    type Item = QueryUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.updates.poll_recv(cx)
    }
}

/// Early-settle threshold: half the requested page size, at least one.
fn settle_threshold(filter: &Filter) -> usize {
    filter.limit.map(|l| (l + 1) / 2).unwrap_or(1).max(1)
}

/// Open one logical query across `relays`.
///
/// Invalid relay URLs are skipped with a warning; they do not count
/// toward completion. Fails only when no relay is usable.
pub fn open_query(
    relays: &[String],
    filter: Filter,
    config: QueryConfig,
) -> Result<QueryHandle, NetworkError> {
    let sub_id = random_hex(16)?;
    let alive = Arc::new(AtomicBool::new(true));
    let (conn_tx, conn_rx) = mpsc::unbounded_channel();

    let mut connections = Vec::new();
    for url in relays {
        if let Err(e) = validate_relay_url(url) {
            warn!(relay = %url, error = %e, "[network] skipping invalid relay");
            continue;
        }
        connections.push(RelayConnection::open(
            normalize_relay_url(url),
            sub_id.clone(),
            filter.clone(),
            conn_tx.clone(),
            alive.clone(),
        ));
    }
    drop(conn_tx);

    if connections.is_empty() {
        return Err(NetworkError::NoRelays);
    }

    let total = connections.len();
    let threshold = settle_threshold(&filter);
    let connections = Arc::new(connections);
    let latch = Arc::new(AtomicBool::new(false));
    let (update_tx, update_rx) = mpsc::unbounded_channel();

    let aggregator = tokio::spawn(run_aggregator(
        conn_rx,
        total,
        threshold,
        config,
        update_tx,
        alive.clone(),
        latch.clone(),
        connections.clone(),
    ));

    Ok(QueryHandle {
        updates: update_rx,
        alive,
        latch,
        connections,
        aggregator,
    })
}

/// The per-query event loop: dedup, fan-in, completion policy.
#[allow(clippy::too_many_arguments)]
async fn run_aggregator(
    mut rx: UnboundedReceiver<ConnEvent>,
    total: usize,
    settle_threshold: usize,
    config: QueryConfig,
    tx: UnboundedSender<QueryUpdate>,
    alive: Arc<AtomicBool>,
    latch: Arc<AtomicBool>,
    connections: Arc<Vec<RelayConnection>>,
) {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut finished = 0usize;
    let mut settle_armed = false;
    let mut settle_elapsed = false;

    let hard = tokio::time::sleep(config.hard_timeout);
    tokio::pin!(hard);
    // Parked until the first event arms it.
    let settle = tokio::time::sleep(IDLE_TIMER);
    tokio::pin!(settle);

    let reason = loop {
        tokio::select! {
            _ = &mut hard => break CompletionReason::HardTimeout,

            _ = &mut settle, if settle_armed && !settle_elapsed => {
                if seen.len() >= settle_threshold {
                    break CompletionReason::EarlySettle;
                }
                settle_elapsed = true;
            }

            msg = rx.recv() => match msg {
                None => break CompletionReason::AllClosed,
                Some(ConnEvent { relay, kind }) => {
                    if !alive.load(Ordering::Acquire) {
                        return;
                    }
                    match kind {
                        ConnEventKind::Event(event) => {
                            // First relay to deliver an id wins.
                            if seen.insert(event.id.to_hex()) {
                                if !settle_armed {
                                    settle_armed = true;
                                    settle.as_mut().reset(
                                        tokio::time::Instant::now() + config.settle_delay,
                                    );
                                }
                                let _ = tx.send(QueryUpdate::Event(event));
                                if settle_elapsed && seen.len() >= settle_threshold {
                                    break CompletionReason::EarlySettle;
                                }
                            }
                        }
                        ConnEventKind::Eose => {
                            debug!(relay = %relay, "[network] eose");
                        }
                        ConnEventKind::Closed => {
                            finished += 1;
                            if finished >= total {
                                break CompletionReason::AllClosed;
                            }
                        }
                        ConnEventKind::Error(e) => {
                            warn!(relay = %relay, error = %e, "[network] relay failed");
                            finished += 1;
                            if finished >= total {
                                break CompletionReason::AllClosed;
                            }
                        }
                    }
                }
            }
        }
    };

    // One-shot latch: whoever wins the race performs the teardown.
    if !latch.swap(true, Ordering::AcqRel) {
        alive.store(false, Ordering::Release);
        for connection in connections.iter() {
            connection.abort();
        }
        debug!(unique = seen.len(), ?reason, "[network] query complete");
        let _ = tx.send(QueryUpdate::Complete(reason));
    }
}

/// Run a query to completion, collecting one page of events.
///
/// Returns the events plus the completion reason. For the next-older page
/// pass `filter.page_before(oldest_created_at)` to a fresh query.
pub async fn fetch_page(
    relays: &[String],
    filter: Filter,
    config: QueryConfig,
) -> Result<(Vec<Event>, CompletionReason), NetworkError> {
    let mut handle = open_query(relays, filter, config)?;
    let mut events = Vec::new();
    while let Some(update) = handle.next_update().await {
        match update {
            QueryUpdate::Event(event) => events.push(event),
            QueryUpdate::Complete(reason) => return Ok((events, reason)),
        }
    }
    Ok((events, CompletionReason::AllClosed))
}

/// Publish one event to several relays, collecting per-relay outcomes.
/// A relay that errors or times out is reported, never retried.
pub async fn publish_event(
    relays: &[String],
    event: &Event,
    timeout: Duration,
) -> Vec<PublishResult> {
    let tasks = relays.iter().map(|url| {
        let url = normalize_relay_url(url);
        let event = event.clone();
        async move {
            match tokio::time::timeout(timeout, publish(&url, &event)).await {
                Ok(Ok((accepted, message))) => PublishResult {
                    relay: url,
                    accepted,
                    message,
                },
                Ok(Err(e)) => PublishResult {
                    relay: url,
                    accepted: false,
                    message: e.to_string(),
                },
                Err(_) => PublishResult {
                    relay: url,
                    accepted: false,
                    message: "publish timed out".to_string(),
                },
            }
        }
    });
    futures::future::join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::nostr::{kinds, EventId, PublicKey};

    fn test_event(id_byte: u8, created_at: u64) -> Event {
        Event {
            id: EventId([id_byte; 32]),
            pubkey: PublicKey([0xcc; 32]),
            created_at,
            kind: kinds::TEXT_NOTE,
            tags: vec![],
            content: format!("event {id_byte}"),
            sig: String::new(),
        }
    }

    fn send(tx: &UnboundedSender<ConnEvent>, relay: &str, kind: ConnEventKind) {
        tx.send(ConnEvent {
            relay: relay.to_string(),
            kind,
        })
        .unwrap();
    }

    struct Harness {
        conn_tx: UnboundedSender<ConnEvent>,
        updates: UnboundedReceiver<QueryUpdate>,
        alive: Arc<AtomicBool>,
        latch: Arc<AtomicBool>,
    }

    fn spawn_aggregator(total: usize, threshold: usize, config: QueryConfig) -> Harness {
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (update_tx, updates) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let latch = Arc::new(AtomicBool::new(false));
        tokio::spawn(run_aggregator(
            conn_rx,
            total,
            threshold,
            config,
            update_tx,
            alive.clone(),
            latch.clone(),
            Arc::new(Vec::new()),
        ));
        Harness {
            conn_tx,
            updates,
            alive,
            latch,
        }
    }

    async fn drain(mut updates: UnboundedReceiver<QueryUpdate>) -> (Vec<Event>, Vec<CompletionReason>) {
        let mut events = Vec::new();
        let mut completions = Vec::new();
        while let Some(update) = updates.recv().await {
            match update {
                QueryUpdate::Event(e) => events.push(e),
                QueryUpdate::Complete(r) => completions.push(r),
            }
        }
        (events, completions)
    }

    #[tokio::test(start_paused = true)]
    async fn dedups_across_relays_and_completes_once_on_all_closed() {
        let h = spawn_aggregator(3, usize::MAX, QueryConfig::default());

        // Relay A yields {1,2}, relay B yields {2,3} then EOSE, C errors.
        send(&h.conn_tx, "wss://a", ConnEventKind::Event(test_event(1, 100)));
        send(&h.conn_tx, "wss://a", ConnEventKind::Event(test_event(2, 99)));
        send(&h.conn_tx, "wss://b", ConnEventKind::Event(test_event(2, 99)));
        send(&h.conn_tx, "wss://b", ConnEventKind::Event(test_event(3, 98)));
        send(&h.conn_tx, "wss://b", ConnEventKind::Eose);
        send(&h.conn_tx, "wss://b", ConnEventKind::Closed);
        send(&h.conn_tx, "wss://c", ConnEventKind::Error("refused".into()));
        send(&h.conn_tx, "wss://a", ConnEventKind::Closed);
        drop(h.conn_tx);

        let (events, completions) = drain(h.updates).await;

        let ids: Vec<String> = events.iter().map(|e| e.id.to_hex()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(
            ids,
            vec![
                EventId([1; 32]).to_hex(),
                EventId([2; 32]).to_hex(),
                EventId([3; 32]).to_hex()
            ]
        );
        assert_eq!(completions, vec![CompletionReason::AllClosed]);
        assert!(h.latch.load(Ordering::Acquire));
        assert!(!h.alive.load(Ordering::Acquire));
    }

    #[tokio::test(start_paused = true)]
    async fn early_settle_fires_when_threshold_met() {
        let config = QueryConfig::default();
        // Page size 20 -> threshold 10.
        let h = spawn_aggregator(2, 10, config);

        // One relay delivers a burst, the other stays silent.
        for i in 0..10u8 {
            send(&h.conn_tx, "wss://a", ConnEventKind::Event(test_event(i + 1, 100)));
        }

        let mut updates = h.updates;
        let mut events = 0;
        let reason = loop {
            match updates.recv().await.unwrap() {
                QueryUpdate::Event(_) => events += 1,
                QueryUpdate::Complete(reason) => break reason,
            }
        };
        assert_eq!(events, 10);
        assert_eq!(reason, CompletionReason::EarlySettle);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_timer_does_not_fire_below_threshold() {
        let h = spawn_aggregator(1, 10, QueryConfig::default());

        send(&h.conn_tx, "wss://a", ConnEventKind::Event(test_event(1, 100)));

        let mut updates = h.updates;
        let mut completions = Vec::new();
        let mut events = 0;
        while let Some(update) = updates.recv().await {
            match update {
                QueryUpdate::Event(_) => events += 1,
                QueryUpdate::Complete(r) => completions.push(r),
            }
            if !completions.is_empty() {
                break;
            }
        }
        assert_eq!(events, 1);
        // One event is below the threshold of 10: only the hard timeout
        // can finish this query.
        assert_eq!(completions, vec![CompletionReason::HardTimeout]);
        let _ = h.conn_tx;
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_completes_silent_query() {
        let h = spawn_aggregator(1, 1, QueryConfig::default());

        let mut updates = h.updates;
        match updates.recv().await.unwrap() {
            QueryUpdate::Complete(reason) => {
                assert_eq!(reason, CompletionReason::HardTimeout)
            }
            other => panic!("unexpected update: {other:?}"),
        }
        assert!(updates.recv().await.is_none());
        let _ = h.conn_tx;
    }

    #[tokio::test(start_paused = true)]
    async fn late_triggers_after_latch_are_noops() {
        let h = spawn_aggregator(2, usize::MAX, QueryConfig::default());

        send(&h.conn_tx, "wss://a", ConnEventKind::Closed);
        send(&h.conn_tx, "wss://b", ConnEventKind::Closed);
        drop(h.conn_tx);

        let (events, completions) = drain(h.updates).await;
        assert!(events.is_empty());
        // Exactly one completion even though channel closure races the
        // all-closed count.
        assert_eq!(completions, vec![CompletionReason::AllClosed]);
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_cancellation_are_dropped() {
        let h = spawn_aggregator(2, usize::MAX, QueryConfig::default());

        h.alive.store(false, Ordering::Release);
        send(&h.conn_tx, "wss://a", ConnEventKind::Event(test_event(1, 100)));
        drop(h.conn_tx);

        let mut updates = h.updates;
        assert!(updates.recv().await.is_none());
    }

    #[test]
    fn settle_threshold_is_half_page() {
        assert_eq!(settle_threshold(&Filter::new().limit(20)), 10);
        assert_eq!(settle_threshold(&Filter::new().limit(5)), 3);
        assert_eq!(settle_threshold(&Filter::new().limit(1)), 1);
        assert_eq!(settle_threshold(&Filter::new()), 1);
    }

    #[test]
    fn open_query_rejects_all_invalid_relays() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let result = open_query(
            &["http://not-a-relay".to_string(), "".to_string()],
            Filter::new(),
            QueryConfig::default(),
        );
        assert!(matches!(result, Err(NetworkError::NoRelays)));
    }
}
