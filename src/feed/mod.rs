//! Upstream feed connector.
//!
//! Owns the single connection to the blockchain log feed. It walks the ranked
//! endpoint list until one accepts, re-sends the transfer subscriptions, and
//! keeps the connection alive with periodic probes. Read errors, probe failures
//! and dial failures are never surfaced: the connector marks itself disconnected
//! and starts another failover cycle, waiting out the backoff between cycles.
//!
//! Decoded transfers are matched on their own tasks, bounded by a semaphore, so
//! a slow match never stalls the read loop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticsLog, Direction};
use crate::engine::MatchingEngine;
use crate::model::{Address, TokenInfo};

mod backoff;
pub use backoff::{BackoffPolicy, FailoverState, compute_backoff};

mod codec;
pub use codec::{
    Decoder, Frame, TRANSFER_TOPIC, keep_alive_request, subscribe_request, unsubscribe_request,
};

mod endpoint;
pub use endpoint::{API_KEY_PLACEHOLDER, Candidate, Endpoint, default_endpoints, rank};

mod error;
pub use error::FeedError;

mod transport;
pub use transport::{Dialer, FrameSink, FrameStream, Transport, WsDialer};

/// Tuning for the connector.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub backoff: BackoffPolicy,
    pub liveness_interval: Duration,
    /// Upper bound on concurrently running match tasks.
    pub max_inflight_matches: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            liveness_interval: Duration::from_secs(30),
            max_inflight_matches: 256,
        }
    }
}

/// Upstream counters, served by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    pub connected: bool,
    pub endpoint: Option<String>,
    pub endpoint_index: usize,
    pub total_connections: u64,
    pub connection_errors: u64,
    pub consecutive_failures: u32,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub malformed_frames: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    /// Subscription id -> token symbol.
    pub subscriptions: BTreeMap<String, String>,
}

/// Mutable connection state, only touched under the connector's state lock.
#[derive(Debug)]
struct ConnectionState {
    stats: FeedStats,
    failover: FailoverState,
    /// Cancels the read and liveness loops of the current connection.
    connection: Option<CancellationToken>,
    /// Newest subscribe request id per token contract. Acks for older
    /// requests are unsubscribed on arrival.
    latest_subscribe: HashMap<Address, u64>,
}

pub struct FeedConnector {
    candidates: Vec<Candidate>,
    settings: FeedSettings,
    dialer: Arc<dyn Dialer>,
    engine: Arc<MatchingEngine>,
    receivers: RwLock<BTreeSet<Address>>,
    state: Mutex<ConnectionState>,
    sink: tokio::sync::Mutex<Option<FrameSink>>,
    decoder: Decoder,
    request_id: AtomicU64,
    connecting: AtomicBool,
    match_permits: Arc<Semaphore>,
    diagnostics: Arc<DiagnosticsLog>,
    shutdown: CancellationToken,
}

/// Public API
impl FeedConnector {
    pub fn new(
        candidates: Vec<Candidate>,
        settings: FeedSettings,
        dialer: Arc<dyn Dialer>,
        engine: Arc<MatchingEngine>,
        diagnostics: Arc<DiagnosticsLog>,
        shutdown: CancellationToken,
    ) -> Self {
        let failover = FailoverState::new(candidates.len());
        let permits = settings.max_inflight_matches.max(1);
        Self {
            candidates,
            settings,
            dialer,
            engine,
            receivers: RwLock::new(BTreeSet::new()),
            state: Mutex::new(ConnectionState {
                stats: FeedStats::default(),
                failover,
                connection: None,
                latest_subscribe: HashMap::new(),
            }),
            sink: tokio::sync::Mutex::new(None),
            decoder: Decoder::new(),
            request_id: AtomicU64::new(1),
            connecting: AtomicBool::new(false),
            match_permits: Arc::new(Semaphore::new(permits)),
            diagnostics,
            shutdown,
        }
    }

    /// Add receivers to the subscription filter. Takes effect on the next subscribe.
    pub fn watch_receivers(&self, receivers: impl IntoIterator<Item = Address>) {
        self.receivers.write().extend(receivers);
    }

    /// Whether `receiver` was newly added to the subscription filter.
    pub fn watch_receiver(&self, receiver: Address) -> bool {
        self.receivers.write().insert(receiver)
    }

    /// Start connecting in the background.
    pub fn start(self: &Arc<Self>) {
        self.trigger_failover();
    }

    /// Connect to the first reachable endpoint, retrying with backoff until one
    /// accepts or shutdown is signalled. A no-op while another cycle is running
    /// or the feed is already connected.
    pub async fn connect_with_failover(self: &Arc<Self>) {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("failover already in progress");
            return;
        }
        if self.is_connected() {
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }
        if self.candidates.is_empty() {
            warn!("no usable upstream endpoints configured");
            self.connecting.store(false, Ordering::SeqCst);
            return;
        }

        {
            let mut state = self.state.lock();
            state.failover.reset_attempts();
            state.stats.consecutive_failures = 0;
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.try_candidates().await {
                break;
            }

            let delay = {
                let mut state = self.state.lock();
                state.stats.consecutive_failures += 1;
                state.failover.record_failure(&self.settings.backoff)
            };
            warn!(
                delay_ms = delay.as_millis() as u64,
                "all upstream endpoints failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.connecting.store(false, Ordering::SeqCst);
        // the new connection may already have dropped while this cycle held the flag
        if !self.is_connected() {
            self.trigger_failover();
        }
    }

    /// Send a Transfer subscription for `token`. Skipped while disconnected; every
    /// token is re-subscribed on connect. Once acknowledged, the subscription
    /// replaces the token's previous one, which is unsubscribed.
    pub async fn subscribe(&self, token: &TokenInfo) -> Result<(), FeedError> {
        if !self.is_connected() {
            debug!(token = %token.symbol, "feed disconnected, subscription deferred");
            return Ok(());
        }
        let receivers: Vec<Address> = self.receivers.read().iter().copied().collect();
        let id = self.next_request_id();
        self.decoder.expect_ack(id, token.contract);
        self.state.lock().latest_subscribe.insert(token.contract, id);
        info!(
            token = %token.symbol,
            contract = %token.contract,
            receivers = receivers.len(),
            "subscribing to transfers"
        );
        self.send(subscribe_request(id, &token.contract, &receivers))
            .await
    }

    /// Re-send the subscription of every token, e.g. after the receiver filter
    /// widened.
    pub async fn resubscribe_all(&self) {
        let tokens: Vec<TokenInfo> = self.engine.tokens().iter().cloned().collect();
        for token in &tokens {
            if let Err(e) = self.subscribe(token).await {
                warn!(token = %token.symbol, error = %e, "subscribe failed");
            }
        }
    }

    /// Send the keep-alive probe.
    pub async fn send_keep_alive(&self) -> Result<(), FeedError> {
        let id = self.next_request_id();
        self.send(keep_alive_request(id)).await
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().stats.connected
    }

    pub fn stats(&self) -> FeedStats {
        self.state.lock().stats.clone()
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsLog> {
        &self.diagnostics
    }

    /// Close the current transport. Background loops stop through the shutdown token.
    pub async fn close(&self) {
        self.mark_disconnected("shutdown").await;
    }
}

/// Private API
impl FeedConnector {
    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn trigger_failover(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.connect_with_failover().await });
    }

    /// One pass over the candidates, starting at the current failover index.
    async fn try_candidates(self: &Arc<Self>) -> bool {
        let start = self.state.lock().failover.current();
        let count = self.candidates.len();

        for offset in 0..count {
            let index = (start + offset) % count;
            let candidate = &self.candidates[index];
            info!(endpoint = %candidate.name, "connecting to upstream");

            let dialed = tokio::time::timeout(
                candidate.handshake_timeout,
                self.dialer.dial(&candidate.url),
            )
            .await
            .unwrap_or_else(|_| {
                Err(FeedError::HandshakeTimeout {
                    endpoint: candidate.name.clone(),
                    timeout: candidate.handshake_timeout,
                })
            });

            match dialed {
                Ok(transport) => {
                    self.install(index, transport).await;
                    return true;
                }
                Err(e) => {
                    warn!(endpoint = %candidate.name, error = %e, "upstream connect failed");
                    self.state.lock().stats.connection_errors += 1;
                    self.diagnostics
                        .note("connect_failed", Direction::Outbound, &e.to_string());
                }
            }
            if self.shutdown.is_cancelled() {
                return false;
            }
        }
        false
    }

    /// Adopt a freshly dialed transport:
    /// - Publish the sink for the send path
    /// - Mark connected and pin the failover index to this endpoint
    /// - Start the read and liveness loops
    /// - Subscribe every token and probe once
    async fn install(self: &Arc<Self>, index: usize, transport: Transport) {
        let Transport { sink, stream } = transport;
        let connection = self.shutdown.child_token();

        *self.sink.lock().await = Some(sink);
        self.decoder.reset();
        {
            let mut state = self.state.lock();
            state.failover.record_success(index);
            state.connection = Some(connection.clone());
            let stats = &mut state.stats;
            stats.connected = true;
            stats.endpoint = Some(self.candidates[index].name.clone());
            stats.endpoint_index = index;
            stats.total_connections += 1;
            stats.consecutive_failures = 0;
            stats.last_connected = Some(Utc::now());
            stats.subscriptions.clear();
            state.latest_subscribe.clear();
        }
        info!(endpoint = %self.candidates[index].name, "upstream connected");
        self.diagnostics.note(
            "connected",
            Direction::Inbound,
            &self.candidates[index].name,
        );

        tokio::spawn(Arc::clone(self).read_loop(stream, connection.clone()));
        tokio::spawn(Arc::clone(self).liveness_loop(connection));

        self.resubscribe_all().await;
        if let Err(e) = self.send_keep_alive().await {
            warn!(error = %e, "initial keep-alive failed");
        }
    }

    /// Drop the transport and stop its loops. Returns whether this call made the
    /// transition, so concurrent triggers start at most one failover.
    async fn mark_disconnected(&self, reason: &str) -> bool {
        let connection = {
            let mut state = self.state.lock();
            if !state.stats.connected {
                return false;
            }
            state.stats.connected = false;
            state.stats.last_disconnected = Some(Utc::now());
            state.connection.take()
        };
        if let Some(connection) = connection {
            connection.cancel();
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        warn!(reason, "upstream disconnected");
        self.diagnostics
            .note("disconnected", Direction::Inbound, reason);
        true
    }

    async fn send(&self, text: String) -> Result<(), FeedError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(FeedError::NotConnected)?;
        sink.send(text.clone()).await?;
        drop(guard);

        self.state.lock().stats.frames_sent += 1;
        self.diagnostics.note("request", Direction::Outbound, &text);
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &str) {
        let id = self.next_request_id();
        match self.send(unsubscribe_request(id, subscription)).await {
            Ok(()) => debug!(subscription, "superseded subscription dropped"),
            Err(e) => warn!(subscription, error = %e, "unsubscribe failed"),
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: FrameStream, connection: CancellationToken) {
        let reason = loop {
            let next = tokio::select! {
                _ = connection.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(text)) => self.handle_frame(&text).await,
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            }
        };

        if self.mark_disconnected(&reason).await {
            self.trigger_failover();
        }
    }

    async fn liveness_loop(self: Arc<Self>, connection: CancellationToken) {
        let period = self.settings.liveness_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = connection.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if !self.is_connected() {
                self.trigger_failover();
                return;
            }
            if let Err(e) = self.send_keep_alive().await {
                warn!(error = %e, "keep-alive failed");
                if self.mark_disconnected("keep-alive failed").await {
                    self.trigger_failover();
                }
                return;
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        self.state.lock().stats.frames_received += 1;

        let frame = match self.decoder.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed upstream frame");
                self.state.lock().stats.malformed_frames += 1;
                self.diagnostics.note("malformed", Direction::Inbound, text);
                return;
            }
        };

        match frame {
            Frame::Transfer(event) => {
                debug!(tx = %event.tx_hash, to = %event.to, amount = %event.amount, "transfer received");
                self.diagnostics.note("transfer", Direction::Inbound, text);
                let Ok(permit) = Arc::clone(&self.match_permits).acquire_owned().await else {
                    return;
                };
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    engine.on_transfer_event(&event);
                    drop(permit);
                });
            }
            Frame::SubscriptionAck {
                request_id,
                contract,
                subscription,
            } => {
                let symbol = self
                    .engine
                    .tokens()
                    .symbol_for(&contract)
                    .unwrap_or("unknown")
                    .to_string();
                info!(request_id, subscription = %subscription, token = %symbol, "subscription confirmed");
                self.diagnostics
                    .note("subscription_ack", Direction::Inbound, text);
                let superseded = {
                    let mut state = self.state.lock();
                    if state.latest_subscribe.get(&contract) == Some(&request_id) {
                        let previous: Vec<String> = state
                            .stats
                            .subscriptions
                            .iter()
                            .filter(|(_, token)| **token == symbol)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for id in &previous {
                            state.stats.subscriptions.remove(id);
                        }
                        state.stats.subscriptions.insert(subscription, symbol);
                        previous
                    } else {
                        vec![subscription]
                    }
                };
                for subscription in superseded {
                    self.unsubscribe(&subscription).await;
                }
            }
            Frame::Reply { id } => {
                debug!(?id, "upstream reply");
                self.diagnostics.note("reply", Direction::Inbound, text);
            }
            Frame::RpcError { id, code, message } => {
                warn!(?id, code, message = %message, "upstream rpc error");
                self.diagnostics.note("rpc_error", Direction::Inbound, text);
            }
            Frame::Ignored { reason } => {
                debug!(reason = %reason, "upstream frame ignored");
            }
        }
    }
}
