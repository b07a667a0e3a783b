//! WebSocket server
//!
//! Accepts client connections and speaks the Nostr wire protocol: EVENT,
//! REQ, CLOSE, COUNT, AUTH and the NEG-* reconciliation frames. Each
//! connection gets its own token bucket, subscription manager and
//! reconciliation sessions; committed writes fan out over a broadcast
//! channel.

use crate::broadcast::{BroadcastEvent, DedupSet, create_broadcast_channel};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::metrics::RelayMetrics;
use crate::policy::{AdminPolicy, Decision, IngestionPolicy, reason};
use crate::rate_limit::{RateLimitConfig, TokenBucket};
use crate::storage::{PutOutcome, QueryHandle, Storage};
use crate::subscription::SubscriptionManager;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use nostr_core::nip42;
use nostr_core::nip77::ReconciliationState;
use nostr_core::wire::{
    self, ClientFrame, auth_frame, closed_frame, count_frame, eose_frame, event_frame,
    neg_err_frame, neg_msg_frame, notice_frame, ok_frame,
};
use nostr_core::{Event, Filter};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Events per send batch while draining a query handle.
const QUERY_BATCH: usize = 64;

/// Pause between backpressure probes of a full outgoing socket.
const BACKPRESSURE_TICK: Duration = Duration::from_millis(25);

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

pub struct RelayServer {
    config: Arc<Config>,
    store: Arc<dyn Storage>,
    broadcast_tx: broadcast::Sender<BroadcastEvent>,
    policy: Arc<Mutex<IngestionPolicy>>,
    admin: Arc<RwLock<AdminPolicy>>,
    metrics: Arc<RelayMetrics>,
}

impl RelayServer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Storage>,
        admin: Arc<RwLock<AdminPolicy>>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (broadcast_tx, _) = create_broadcast_channel();
        let policy = Arc::new(Mutex::new(IngestionPolicy::new(
            config.skew_future_seconds,
            config.skew_past_seconds,
            config.replay_ttl_seconds,
            config.auth == crate::config::AuthMode::Required,
        )));

        // Committed writes reach subscribers through the store's notify
        // path, keyed by the backend row.
        let notify_store = Arc::clone(&store);
        let notify_tx = broadcast_tx.clone();
        store.notify_callback(Arc::new(move |key| {
            if let Ok(Some(event)) = notify_store.get_by_key(key) {
                let _ = notify_tx.send(BroadcastEvent { key, event });
            }
        }));

        Self {
            config,
            store,
            broadcast_tx,
            policy,
            admin,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept loop. Runs until the listener fails; a bind failure is
    /// returned to the caller.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| RelayError::Config(format!("bind {}: {}", self.config.listen, e)))?;
        info!("relay listening on {}", self.config.listen);

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let blocked = self
                        .admin
                        .read()
                        .map(|a| a.is_ip_blocked(&addr.ip().to_string()))
                        .unwrap_or(false);
                    if blocked {
                        warn!("rejected connection from blocked ip {}", addr.ip());
                        RelayMetrics::incr(&self.metrics.connections_blocked);
                        continue;
                    }

                    RelayMetrics::incr(&self.metrics.connections_opened);
                    let config = Arc::clone(&self.config);
                    let store = Arc::clone(&self.store);
                    let policy = Arc::clone(&self.policy);
                    let admin = Arc::clone(&self.admin);
                    let metrics = Arc::clone(&self.metrics);
                    let broadcast_rx = self.broadcast_tx.subscribe();

                    tokio::spawn(async move {
                        let result = handle_connection(
                            stream,
                            addr,
                            config,
                            store,
                            policy,
                            admin,
                            Arc::clone(&metrics),
                            broadcast_rx,
                        )
                        .await;
                        RelayMetrics::incr(&metrics.connections_closed);
                        if let Err(e) = result {
                            debug!("connection {} ended with error: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Per-connection mutable state.
struct ConnState {
    subscriptions: SubscriptionManager,
    neg_sessions: HashMap<String, ReconciliationState>,
    bucket: TokenBucket,
    dedup: DedupSet,
    authenticated: Option<String>,
    challenge: String,
}

struct MessageContext<'a> {
    config: &'a Config,
    store: &'a Arc<dyn Storage>,
    policy: &'a Mutex<IngestionPolicy>,
    admin: &'a RwLock<AdminPolicy>,
    metrics: &'a RelayMetrics,
    conn: &'a mut ConnState,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<Config>,
    store: Arc<dyn Storage>,
    policy: Arc<Mutex<IngestionPolicy>>,
    admin: Arc<RwLock<AdminPolicy>>,
    metrics: Arc<RelayMetrics>,
    mut broadcast_rx: broadcast::Receiver<BroadcastEvent>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| RelayError::WebSocket(e.to_string()))?;
    debug!("websocket established: {}", addr);

    let (mut write, mut read) = ws_stream.split();
    let mut conn = ConnState {
        subscriptions: SubscriptionManager::new(config.max_subs),
        neg_sessions: HashMap::new(),
        bucket: TokenBucket::new(RateLimitConfig {
            ops_per_sec: config.rate_ops_per_sec,
            burst: config.rate_burst,
        }),
        dedup: DedupSet::new(),
        authenticated: None,
        challenge: nip42::generate_challenge(),
    };

    if config.auth.challenges() {
        send_value(&mut write, &metrics, &auth_frame(&conn.challenge)).await?;
    }

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        RelayMetrics::add(&metrics.bytes_in, text.len() as u64);
                        if text.len() > config.max_message_size {
                            warn!("oversized frame from {}: {} bytes", addr, text.len());
                            send_value(&mut write, &metrics, &notice_frame(reason::MALFORMED_FRAME))
                                .await?;
                            continue;
                        }

                        let frame = match wire::parse_client_frame(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!("unparseable frame from {}: {}", addr, e);
                                send_value(&mut write, &metrics, &notice_frame(&e.to_string()))
                                    .await?;
                                continue;
                            }
                        };

                        let mut ctx = MessageContext {
                            config: &config,
                            store: &store,
                            policy: &policy,
                            admin: &admin,
                            metrics: &metrics,
                            conn: &mut conn,
                        };
                        match handle_frame(frame, &mut ctx) {
                            FrameOutcome::Responses(responses) => {
                                for response in responses {
                                    send_value(&mut write, &metrics, &response).await?;
                                }
                            }
                            FrameOutcome::Stream { sub_id, handle, responses } => {
                                for response in responses {
                                    send_value(&mut write, &metrics, &response).await?;
                                }
                                stream_query(
                                    &mut write,
                                    &metrics,
                                    &config,
                                    &mut conn,
                                    &sub_id,
                                    handle,
                                )
                                .await?;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("websocket error from {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }

            live = broadcast_rx.recv() => {
                match live {
                    Ok(broadcast_event) => {
                        deliver_live(&mut write, &metrics, &mut conn, &broadcast_event).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("connection {} lagged {} broadcast events", addr, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

async fn send_value(write: &mut WsSink, metrics: &RelayMetrics, value: &Value) -> Result<()> {
    let text = serde_json::to_string(value)?;
    RelayMetrics::add(&metrics.bytes_out, text.len() as u64);
    write
        .send(Message::text(text))
        .await
        .map_err(|e| RelayError::WebSocket(e.to_string()))
}

/// Fan a committed write out to this connection's matching subscriptions.
async fn deliver_live(
    write: &mut WsSink,
    metrics: &RelayMetrics,
    conn: &mut ConnState,
    broadcast_event: &BroadcastEvent,
) -> Result<()> {
    let matching: Vec<String> = conn
        .subscriptions
        .matching_ids(&broadcast_event.event)
        .into_iter()
        .map(String::from)
        .collect();
    if matching.is_empty() {
        return Ok(());
    }
    if !conn.dedup.first_delivery(broadcast_event.key) {
        return Ok(());
    }
    for sub_id in matching {
        send_value(write, metrics, &event_frame(&sub_id, &broadcast_event.event)).await?;
    }
    Ok(())
}

/// Drain a query handle in batches and finish with EOSE. A socket that
/// stops accepting writes for too many consecutive ticks gets the
/// subscription CLOSED instead.
async fn stream_query(
    write: &mut WsSink,
    metrics: &RelayMetrics,
    config: &Config,
    conn: &mut ConnState,
    sub_id: &str,
    mut handle: QueryHandle,
) -> Result<()> {
    let mut stalled_ticks: u32 = 0;
    while !handle.is_exhausted() {
        for event in handle.next_batch(QUERY_BATCH) {
            let text = serde_json::to_string(&event_frame(sub_id, &event))?;
            loop {
                match tokio::time::timeout(BACKPRESSURE_TICK, write.feed(Message::text(text.clone())))
                    .await
                {
                    Ok(Ok(())) => {
                        RelayMetrics::add(&metrics.bytes_out, text.len() as u64);
                        stalled_ticks = 0;
                        break;
                    }
                    Ok(Err(e)) => return Err(RelayError::WebSocket(e.to_string())),
                    Err(_) => {
                        // socket did not accept the frame within a tick
                        stalled_ticks += 1;
                        if stalled_ticks >= config.backpressure_max_ticks {
                            warn!("dropping stalled subscription {}", sub_id);
                            conn.subscriptions.unsubscribe(sub_id);
                            RelayMetrics::incr(&metrics.subscriptions_closed);
                            return send_value(
                                write,
                                metrics,
                                &closed_frame(sub_id, reason::BACKPRESSURE),
                            )
                            .await;
                        }
                    }
                }
            }
        }
        if let Err(e) = write.flush().await {
            return Err(RelayError::WebSocket(e.to_string()));
        }
    }
    send_value(write, metrics, &eose_frame(sub_id)).await
}

enum FrameOutcome {
    Responses(Vec<Value>),
    /// Responses to send first, then a query handle to stream before EOSE.
    Stream {
        sub_id: String,
        handle: QueryHandle,
        responses: Vec<Value>,
    },
}

fn handle_frame(frame: ClientFrame, ctx: &mut MessageContext<'_>) -> FrameOutcome {
    match frame {
        ClientFrame::Event(event) => FrameOutcome::Responses(handle_event(*event, ctx)),
        ClientFrame::Auth(event) => FrameOutcome::Responses(handle_auth(*event, ctx)),
        ClientFrame::Req { sub_id, filters } => handle_req(sub_id, filters, ctx),
        ClientFrame::Close { sub_id } => {
            if ctx.conn.subscriptions.unsubscribe(&sub_id) {
                RelayMetrics::incr(&ctx.metrics.subscriptions_closed);
            }
            FrameOutcome::Responses(vec![])
        }
        ClientFrame::Count { sub_id, filters } => {
            FrameOutcome::Responses(handle_count(sub_id, filters, ctx))
        }
        ClientFrame::NegOpen {
            sub_id,
            filter,
            initial_message,
        } => FrameOutcome::Responses(handle_neg_open(sub_id, *filter, &initial_message, ctx)),
        ClientFrame::NegMsg { sub_id, message } => {
            FrameOutcome::Responses(handle_neg_msg(sub_id, &message, ctx))
        }
        ClientFrame::NegClose { sub_id } => {
            ctx.conn.neg_sessions.remove(&sub_id);
            FrameOutcome::Responses(vec![])
        }
    }
}

fn store_error_reason(err: &RelayError) -> &'static str {
    match err {
        RelayError::Pool(_) => reason::STORE_UNAVAILABLE,
        _ => reason::STORE_FAILED,
    }
}

fn handle_event(event: Event, ctx: &mut MessageContext<'_>) -> Vec<Value> {
    RelayMetrics::incr(&ctx.metrics.events_received);

    if !ctx.conn.bucket.allow() {
        RelayMetrics::incr(&ctx.metrics.events_rejected);
        return vec![ok_frame(&event.id, false, reason::RATE_LIMITED)];
    }

    let admin = match ctx.admin.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return vec![ok_frame(&event.id, false, reason::STORE_UNAVAILABLE)],
    };
    let decision = match ctx.policy.lock() {
        Ok(mut policy) => policy.decide(&event, unix_now(), ctx.conn.authenticated.as_deref(), &admin),
        Err(_) => return vec![ok_frame(&event.id, false, reason::STORE_UNAVAILABLE)],
    };

    match decision {
        Decision::Reject(why) => {
            RelayMetrics::incr(&ctx.metrics.events_rejected);
            vec![ok_frame(&event.id, false, why)]
        }
        Decision::AcceptNoStore(why) => {
            RelayMetrics::incr(&ctx.metrics.events_duplicate);
            vec![ok_frame(&event.id, true, why)]
        }
        Decision::Store => match ctx.store.put_event(&event) {
            Ok(outcome) => {
                if outcome.is_written() {
                    RelayMetrics::incr(&ctx.metrics.events_stored);
                }
                let why = match outcome {
                    PutOutcome::Duplicate | PutOutcome::Superseded => {
                        RelayMetrics::incr(&ctx.metrics.events_duplicate);
                        reason::DUPLICATE
                    }
                    _ => reason::OK,
                };
                vec![ok_frame(&event.id, true, why)]
            }
            Err(e) => {
                error!("store failed for {}: {}", event.id, e);
                RelayMetrics::incr(&ctx.metrics.store_errors);
                vec![ok_frame(&event.id, false, store_error_reason(&e))]
            }
        },
    }
}

fn handle_auth(event: Event, ctx: &mut MessageContext<'_>) -> Vec<Value> {
    match nip42::validate_auth_event(&event, &ctx.conn.challenge, unix_now()) {
        Ok(pubkey) => {
            info!("connection authenticated as {}", pubkey);
            ctx.conn.authenticated = Some(pubkey);
            vec![ok_frame(&event.id, true, reason::OK)]
        }
        Err(e) => {
            debug!("auth rejected: {}", e);
            vec![ok_frame(&event.id, false, reason::AUTH_REQUIRED)]
        }
    }
}

/// Effective result cap for a filter set: the largest requested limit,
/// clamped to the configured maximum.
fn effective_limit(filters: &[Filter], max_limit: usize) -> usize {
    filters
        .iter()
        .filter_map(|f| f.limit)
        .max()
        .unwrap_or(max_limit)
        .min(max_limit)
}

/// Required-auth mode refuses subscription-class frames until the
/// connection has authenticated.
fn needs_auth(ctx: &MessageContext<'_>) -> bool {
    ctx.config.auth == crate::config::AuthMode::Required && ctx.conn.authenticated.is_none()
}

fn handle_req(sub_id: String, filters: Vec<Filter>, ctx: &mut MessageContext<'_>) -> FrameOutcome {
    if needs_auth(ctx) {
        return FrameOutcome::Responses(vec![closed_frame(&sub_id, reason::AUTH_REQUIRED)]);
    }
    if !ctx.conn.bucket.allow() {
        return FrameOutcome::Responses(vec![closed_frame(&sub_id, reason::RATE_LIMITED)]);
    }
    if filters.len() > ctx.config.max_filters {
        return FrameOutcome::Responses(vec![closed_frame(&sub_id, reason::BAD_FILTER)]);
    }
    if !ctx.conn.subscriptions.subscribe(sub_id.clone(), filters.clone()) {
        return FrameOutcome::Responses(vec![closed_frame(&sub_id, reason::TOO_MANY_SUBS)]);
    }
    RelayMetrics::incr(&ctx.metrics.subscriptions_opened);

    let limit = effective_limit(&filters, ctx.config.max_limit);

    // NIP-50: a search filter delegates to the driver, which may not
    // support it.
    let search = filters.iter().find(|f| f.has_search());
    let query_result = if let Some(scope) = search {
        let Some(query) = scope.search.as_deref() else {
            ctx.conn.subscriptions.unsubscribe(&sub_id);
            return FrameOutcome::Responses(vec![closed_frame(&sub_id, reason::BAD_FILTER)]);
        };
        match ctx.store.search(query, scope, limit) {
            Ok(Some(handle)) => Ok(handle),
            Ok(None) => {
                ctx.conn.subscriptions.unsubscribe(&sub_id);
                return FrameOutcome::Responses(vec![closed_frame(
                    &sub_id,
                    reason::UNSUPPORTED_SEARCH,
                )]);
            }
            Err(e) => Err(e),
        }
    } else {
        ctx.store.query(&filters, limit)
    };

    RelayMetrics::incr(&ctx.metrics.queries_executed);
    let handle = match query_result {
        Ok(handle) => handle,
        Err(e) => {
            error!("query failed for {}: {}", sub_id, e);
            RelayMetrics::incr(&ctx.metrics.store_errors);
            ctx.conn.subscriptions.unsubscribe(&sub_id);
            return FrameOutcome::Responses(vec![closed_frame(&sub_id, store_error_reason(&e))]);
        }
    };

    FrameOutcome::Stream {
        sub_id,
        handle,
        responses: vec![],
    }
}

fn handle_count(sub_id: String, filters: Vec<Filter>, ctx: &mut MessageContext<'_>) -> Vec<Value> {
    if needs_auth(ctx) {
        return vec![closed_frame(&sub_id, reason::AUTH_REQUIRED)];
    }
    if !ctx.conn.bucket.allow() {
        return vec![closed_frame(&sub_id, reason::RATE_LIMITED)];
    }
    if filters.len() > ctx.config.max_filters {
        return vec![closed_frame(&sub_id, reason::BAD_FILTER)];
    }
    RelayMetrics::incr(&ctx.metrics.queries_executed);
    match ctx.store.count(&filters) {
        Ok(count) => vec![count_frame(&sub_id, count)],
        Err(e) => {
            error!("count failed for {}: {}", sub_id, e);
            RelayMetrics::incr(&ctx.metrics.store_errors);
            vec![closed_frame(&sub_id, reason::COUNT_FAILED)]
        }
    }
}

fn handle_neg_open(
    sub_id: String,
    filter: Filter,
    initial_message: &str,
    ctx: &mut MessageContext<'_>,
) -> Vec<Value> {
    if !ctx.config.negentropy_enabled {
        return vec![neg_err_frame(&sub_id, reason::NEGENTROPY_DISABLED)];
    }
    if needs_auth(ctx) {
        return vec![neg_err_frame(&sub_id, reason::AUTH_REQUIRED)];
    }
    if !ctx.conn.bucket.allow() {
        return vec![neg_err_frame(&sub_id, reason::RATE_LIMITED)];
    }

    // a reopen replaces any prior session for the id
    ctx.conn.neg_sessions.remove(&sub_id);

    let mut state = match ctx.store.set_digest(&filter) {
        Ok(Some(state)) => state,
        Ok(None) => {
            return vec![neg_err_frame(&sub_id, reason::NEGENTROPY_NOT_IMPLEMENTED)];
        }
        Err(e) => {
            error!("digest failed for {}: {}", sub_id, e);
            return vec![neg_err_frame(&sub_id, store_error_reason(&e))];
        }
    };

    reconcile_step(sub_id, &mut state, initial_message, ctx)
}

fn handle_neg_msg(sub_id: String, message: &str, ctx: &mut MessageContext<'_>) -> Vec<Value> {
    let Some(mut state) = ctx.conn.neg_sessions.remove(&sub_id) else {
        return vec![neg_err_frame(&sub_id, reason::MALFORMED_FRAME)];
    };
    reconcile_step(sub_id, &mut state, message, ctx)
}

/// Run one reconciliation round and either park the session for the next
/// NEG-MSG or drop it when complete.
fn reconcile_step(
    sub_id: String,
    state: &mut ReconciliationState,
    message_hex: &str,
    ctx: &mut MessageContext<'_>,
) -> Vec<Value> {
    let Ok(message) = hex::decode(message_hex) else {
        return vec![neg_err_frame(&sub_id, reason::MALFORMED_FRAME)];
    };
    match state.reconcile(&message) {
        Ok(reply) => {
            let frame = neg_msg_frame(&sub_id, &hex::encode(&reply));
            if !state.is_complete() {
                ctx.conn
                    .neg_sessions
                    .insert(sub_id, std::mem::replace(state, ReconciliationState::new(vec![])));
            }
            vec![frame]
        }
        Err(e) => {
            debug!("reconciliation failed for {}: {}", sub_id, e);
            vec![neg_err_frame(&sub_id, reason::MALFORMED_FRAME)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_limit_clamps() {
        let unlimited = Filter::default();
        assert_eq!(effective_limit(&[unlimited.clone()], 500), 500);

        let small = Filter {
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(effective_limit(&[small], 500), 10);

        let huge = Filter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(effective_limit(&[huge, unlimited], 500), 500);
    }

    #[test]
    fn test_store_error_reason_mapping() {
        assert_eq!(
            store_error_reason(&RelayError::Storage("x".to_string())),
            reason::STORE_FAILED
        );
    }
}
