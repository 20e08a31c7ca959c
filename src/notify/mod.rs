//! Client notification manager.
//!
//! Holds at most one subscriber connection per payment and pushes payment
//! results to it. Each connection runs a read loop and a heartbeat: the
//! heartbeat pings every `ping_interval` and closes the connection once nothing
//! has been heard from the peer for `liveness_timeout`.
//!
//! Every write is bounded by `write_timeout`, and results are delivered on their
//! own tasks, so a client that stops draining its socket only stalls itself.
//!
//! A new connection for a payment replaces the previous map entry. The previous
//! transport is left to fail its own heartbeat; its close never removes the
//! replacement.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, interval_at, sleep_until, timeout};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::{DiagnosticsEntry, DiagnosticsLog, Direction};
use crate::model::{Outcome, PaymentId, ResultRecord, TokenRegistry};

mod message;
pub use message::{AMOUNT_PRECISION, ClientMessage, MessageType};

mod subscriber;
pub use subscriber::{ClientSink, ClientStream, Subscriber, SubscriberState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("no subscriber for payment {0}")]
    NoSubscriber(PaymentId),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct NotifierSettings {
    #[serde(rename = "ping_interval_secs", with = "crate::config::secs")]
    pub ping_interval: Duration,
    #[serde(rename = "liveness_timeout_secs", with = "crate::config::secs")]
    pub liveness_timeout: Duration,
    /// Longest a single frame write may block before the connection is dropped.
    #[serde(rename = "write_timeout_secs", with = "crate::config::secs")]
    pub write_timeout: Duration,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            liveness_timeout: Duration::from_secs(90),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Client-side counters, served by the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub active_connections: usize,
    pub total_connections: u64,
    pub closed_connections: u64,
    pub heartbeat_timeouts: u64,
    pub read_errors: u64,
    pub send_errors: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

/// Why a subscriber was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    SendError,
    HeartbeatTimeout,
    Shutdown,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadError => "read error",
            CloseReason::SendError => "send error",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    subscribers: HashMap<PaymentId, Arc<Subscriber>>,
    stats: ClientStats,
}

pub struct NotificationManager {
    registry: RwLock<Registry>,
    tokens: Arc<TokenRegistry>,
    settings: NotifierSettings,
    diagnostics: Arc<DiagnosticsLog>,
    shutdown: CancellationToken,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Public API
impl NotificationManager {
    pub fn new(
        tokens: Arc<TokenRegistry>,
        settings: NotifierSettings,
        diagnostics: Arc<DiagnosticsLog>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            tokens,
            settings,
            diagnostics,
            shutdown,
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        }
    }

    /// Adopt an upgraded client connection for `payment_id`: register it, send
    /// the acknowledgement, then start its read loop and heartbeat.
    pub async fn attach(
        self: &Arc<Self>,
        payment_id: impl Into<PaymentId>,
        sink: ClientSink,
        stream: ClientStream,
    ) -> Arc<Subscriber> {
        let payment_id = payment_id.into();
        let subscriber = Arc::new(Subscriber::new(
            payment_id.clone(),
            sink,
            self.shutdown.child_token(),
        ));

        {
            let mut registry = self.registry.write();
            if registry
                .subscribers
                .insert(payment_id.clone(), Arc::clone(&subscriber))
                .is_some()
            {
                debug!(payment_id = %payment_id, "replacing previous subscriber");
            }
            registry.stats.total_connections += 1;
            registry.stats.last_connected = Some(Utc::now());
        }
        subscriber.set_state(SubscriberState::Open);
        info!(payment_id = %payment_id, session_id = subscriber.session_id(), "client connected");

        let ack = ClientMessage::connection_ack(&payment_id, subscriber.session_id());
        if let Err(e) = self.send_to(&subscriber, &ack).await {
            warn!(payment_id = %payment_id, error = %e, "connection ack failed");
            return subscriber;
        }

        tokio::spawn(Arc::clone(self).read_loop(Arc::clone(&subscriber), stream));
        tokio::spawn(Arc::clone(self).heartbeat(Arc::clone(&subscriber)));
        subscriber
    }

    /// Push a payment result to its subscriber, if one is connected.
    pub async fn dispatch(&self, record: &ResultRecord) -> Result<(), NotifyError> {
        let Some(subscriber) = self.subscriber(&record.payment_id) else {
            info!(
                payment_id = %record.payment_id,
                status = record.outcome.status(),
                "no subscriber for result"
            );
            return Err(NotifyError::NoSubscriber(record.payment_id.clone()));
        };

        let decimals = match &record.outcome {
            Outcome::Paid(receipt) => {
                self.tokens.decimals_of(&receipt.token).unwrap_or(18)
            }
            _ => 18,
        };
        let update = ClientMessage::status_update(&record.payment_id, &record.outcome, decimals);
        self.send_to(&subscriber, &update).await?;
        info!(
            payment_id = %record.payment_id,
            status = record.outcome.status(),
            "payment status pushed"
        );
        Ok(())
    }

    /// Send an `error` frame to the subscriber of `payment_id`.
    pub async fn push_error(
        &self,
        payment_id: &str,
        code: &str,
        message: &str,
    ) -> Result<(), NotifyError> {
        let subscriber = self
            .subscriber(payment_id)
            .ok_or_else(|| NotifyError::NoSubscriber(payment_id.to_string()))?;
        self.send_to(&subscriber, &ClientMessage::error(payment_id, code, message))
            .await
    }

    /// Drain the dispatch channel until it closes. Each record is pushed on its
    /// own task.
    pub async fn run(self: &Arc<Self>, mut stream: impl Stream<Item = ResultRecord> + Unpin) {
        while let Some(record) = stream.next().await {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                // a missing or failed subscriber must not stop the notifier
                let _ = manager.dispatch(&record).await;
            });
        }
    }

    /// Tear down a subscriber. Safe to call repeatedly or concurrently; only the
    /// first call does the work. Returns whether this call closed it.
    pub async fn close(&self, subscriber: &Arc<Subscriber>, reason: CloseReason) -> bool {
        if !subscriber.begin_close() {
            return false;
        }
        subscriber.set_state(SubscriberState::Closing);
        subscriber.cancel_token().cancel();

        {
            let mut registry = self.registry.write();
            let payment_id = subscriber.payment_id();
            let current = registry
                .subscribers
                .get(payment_id)
                .is_some_and(|s| Arc::ptr_eq(s, subscriber));
            if current {
                registry.subscribers.remove(payment_id);
            }
            let stats = &mut registry.stats;
            stats.closed_connections += 1;
            stats.last_disconnected = Some(Utc::now());
            match reason {
                CloseReason::HeartbeatTimeout => stats.heartbeat_timeouts += 1,
                CloseReason::ReadError => stats.read_errors += 1,
                CloseReason::SendError => stats.send_errors += 1,
                CloseReason::PeerClosed | CloseReason::Shutdown => {}
            }
        }

        if timeout(self.settings.write_timeout, subscriber.shutdown_transport())
            .await
            .is_err()
        {
            debug!(payment_id = subscriber.payment_id(), "transport close timed out");
        }
        subscriber.set_state(SubscriberState::Closed);
        info!(
            payment_id = subscriber.payment_id(),
            session_id = subscriber.session_id(),
            reason = reason.as_str(),
            "client disconnected"
        );
        self.diagnostics.record(
            DiagnosticsEntry::new("disconnected", Direction::Inbound, reason.as_str())
                .with_payment(subscriber.payment_id()),
        );
        true
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        let subscribers: Vec<Arc<Subscriber>> =
            self.registry.read().subscribers.values().cloned().collect();
        for subscriber in subscribers {
            self.close(&subscriber, CloseReason::Shutdown).await;
        }
    }

    pub fn subscriber(&self, payment_id: &str) -> Option<Arc<Subscriber>> {
        self.registry.read().subscribers.get(payment_id).cloned()
    }

    pub fn is_connected(&self, payment_id: &str) -> bool {
        self.registry.read().subscribers.contains_key(payment_id)
    }

    pub fn stats(&self) -> ClientStats {
        let registry = self.registry.read();
        ClientStats {
            active_connections: registry.subscribers.len(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            ..registry.stats.clone()
        }
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticsLog> {
        &self.diagnostics
    }
}

/// Private API
impl NotificationManager {
    /// Send one frame; a failed or stalled write closes the connection.
    async fn send_to(
        &self,
        subscriber: &Arc<Subscriber>,
        message: &ClientMessage,
    ) -> Result<(), NotifyError> {
        let written = tokio::select! {
            _ = subscriber.cancel_token().cancelled() => Err(NotifyError::Closed),
            written = timeout(self.settings.write_timeout, subscriber.send(message)) => {
                written.unwrap_or_else(|_| Err(NotifyError::SendFailed("write timed out".to_string())))
            }
        };
        match written {
            Ok(()) => {
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.diagnostics.record(
                    DiagnosticsEntry::new(
                        message.kind.as_str(),
                        Direction::Outbound,
                        &message.to_json(),
                    )
                    .with_payment(subscriber.payment_id()),
                );
                Ok(())
            }
            Err(NotifyError::Closed) => Err(NotifyError::Closed),
            Err(e) => {
                warn!(payment_id = subscriber.payment_id(), error = %e, "client send failed");
                self.close(subscriber, CloseReason::SendError).await;
                Err(e)
            }
        }
    }

    async fn read_loop(self: Arc<Self>, subscriber: Arc<Subscriber>, mut stream: ClientStream) {
        let cancel = subscriber.cancel_token().clone();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(text)) => {
                    subscriber.touch();
                    self.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.handle_client_frame(&subscriber, &text).await;
                }
                Some(Err(e)) => {
                    warn!(payment_id = subscriber.payment_id(), error = %e, "client read failed");
                    self.close(&subscriber, CloseReason::ReadError).await;
                    return;
                }
                None => {
                    self.close(&subscriber, CloseReason::PeerClosed).await;
                    return;
                }
            }
        }
    }

    async fn handle_client_frame(&self, subscriber: &Arc<Subscriber>, text: &str) {
        self.diagnostics.record(
            DiagnosticsEntry::new("client_frame", Direction::Inbound, text)
                .with_payment(subscriber.payment_id()),
        );
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) if message.kind == MessageType::Ping => {
                let pong = ClientMessage::pong(subscriber.payment_id());
                let _ = self.send_to(subscriber, &pong).await;
            }
            Ok(message) => {
                debug!(payment_id = subscriber.payment_id(), kind = ?message.kind, "client frame");
            }
            Err(e) => {
                debug!(payment_id = subscriber.payment_id(), error = %e, "unparseable client frame");
            }
        }
    }

    async fn heartbeat(self: Arc<Self>, subscriber: Arc<Subscriber>) {
        let NotifierSettings {
            ping_interval,
            liveness_timeout,
            ..
        } = self.settings;
        let cancel = subscriber.cancel_token().clone();
        let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);

        loop {
            let deadline = subscriber.last_seen() + liveness_timeout;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = sleep_until(deadline) => {
                    if subscriber.idle_for() >= liveness_timeout {
                        warn!(payment_id = subscriber.payment_id(), "client heartbeat timed out");
                        self.close(&subscriber, CloseReason::HeartbeatTimeout).await;
                        return;
                    }
                }
                _ = ticker.tick() => {
                    let ping = ClientMessage::ping(subscriber.payment_id());
                    // a ping still blocked at the deadline is abandoned
                    tokio::select! {
                        sent = self.send_to(&subscriber, &ping) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        _ = sleep_until(deadline) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::SinkExt as _;
    use futures::channel::mpsc;
    use serde_json::Value;

    use crate::Amount;
    use crate::model::{Address, Receipt, TokenInfo, TxHash};

    // test utils

    /// Client side of an in-memory connection.
    struct Client {
        to_server: mpsc::UnboundedSender<Result<String, NotifyError>>,
        from_server: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        async fn next_frame(&mut self) -> Value {
            let text = self.from_server.next().await.unwrap();
            serde_json::from_str(&text).unwrap()
        }

        fn say(&self, text: &str) {
            self.to_server.unbounded_send(Ok(text.to_string())).unwrap();
        }
    }

    fn connection() -> (ClientSink, ClientStream, Client) {
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<String, NotifyError>>();
        let sink: ClientSink =
            Box::pin(out_tx.sink_map_err(|e| NotifyError::SendFailed(e.to_string())));
        let stream: ClientStream = Box::pin(in_rx);
        (
            sink,
            stream,
            Client {
                to_server: in_tx,
                from_server: out_rx,
            },
        )
    }

    /// Server-side halves of a connection whose client never reads. The sink
    /// takes two frames, then every write blocks.
    struct Stalled {
        _unread: mpsc::Receiver<String>,
        _to_server: mpsc::UnboundedSender<Result<String, NotifyError>>,
    }

    fn stalled_connection() -> (ClientSink, ClientStream, Stalled) {
        let (out_tx, out_rx) = mpsc::channel::<String>(1);
        let (in_tx, in_rx) = mpsc::unbounded::<Result<String, NotifyError>>();
        let sink: ClientSink =
            Box::pin(out_tx.sink_map_err(|e| NotifyError::SendFailed(e.to_string())));
        (
            sink,
            Box::pin(in_rx),
            Stalled {
                _unread: out_rx,
                _to_server: in_tx,
            },
        )
    }

    fn manager() -> Arc<NotificationManager> {
        let tokens = Arc::new(TokenRegistry::new([TokenInfo {
            symbol: "USDT".to_string(),
            contract: Address::new([0x55; 20]),
            decimals: 18,
        }]));
        Arc::new(NotificationManager::new(
            tokens,
            NotifierSettings::default(),
            Arc::new(DiagnosticsLog::new(100)),
            CancellationToken::new(),
        ))
    }

    async fn connect(manager: &Arc<NotificationManager>, payment_id: &str) -> (Arc<Subscriber>, Client) {
        let (sink, stream, mut client) = connection();
        let subscriber = manager.attach(payment_id, sink, stream).await;
        let ack = client.next_frame().await;
        assert_eq!(ack["type"], "connection_ack");
        (subscriber, client)
    }

    fn paid(payment_id: &str) -> ResultRecord {
        ResultRecord {
            payment_id: payment_id.to_string(),
            outcome: Outcome::Paid(Receipt {
                sender: Address::new([0x01; 20]),
                tx_hash: TxHash::new([0x33; 32]),
                block_number: 7,
                confirmations: 1,
                amount: Amount::from_base_units(10_000_000_000_000_000_000),
                token: "USDT".to_string(),
            }),
        }
    }

    // Attach

    #[tokio::test(start_paused = true)]
    async fn attach_sends_ack_with_session_id() {
        let manager = manager();
        let (sink, stream, mut client) = connection();
        let subscriber = manager.attach("pay_1", sink, stream).await;

        let ack = client.next_frame().await;
        assert_eq!(ack["type"], "connection_ack");
        assert_eq!(ack["paymentId"], "pay_1");
        assert_eq!(ack["data"]["sessionId"], subscriber.session_id());
        assert_eq!(subscriber.state(), SubscriberState::Open);
        assert!(manager.is_connected("pay_1"));
        assert_eq!(manager.stats().active_connections, 1);
    }

    // Dispatch

    #[tokio::test(start_paused = true)]
    async fn dispatch_pushes_status_update() {
        let manager = manager();
        let (_subscriber, mut client) = connect(&manager, "pay_1").await;

        manager.dispatch(&paid("pay_1")).await.unwrap();

        let update = client.next_frame().await;
        assert_eq!(update["type"], "payment_status_update");
        assert_eq!(update["data"]["status"], "paid");
        assert_eq!(update["data"]["amount"], "10.000000");
        assert_eq!(update["data"]["blockNumber"], 7);
    }

    #[tokio::test]
    async fn dispatch_without_subscriber_is_dropped() {
        let manager = manager();
        assert_eq!(
            manager.dispatch(&paid("pay_9")).await,
            Err(NotifyError::NoSubscriber("pay_9".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_send_failure_closes_connection() {
        let manager = manager();
        let (subscriber, client) = connect(&manager, "pay_1").await;
        let Client {
            to_server,
            from_server,
        } = client;
        drop(from_server);

        assert!(matches!(
            manager.dispatch(&paid("pay_1")).await,
            Err(NotifyError::SendFailed(_))
        ));
        assert_eq!(subscriber.state(), SubscriberState::Closed);
        assert!(!manager.is_connected("pay_1"));
        assert_eq!(manager.stats().send_errors, 1);
        drop(to_server);
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_records() {
        let manager = manager();
        let (_subscriber, mut client) = connect(&manager, "pay_1").await;

        manager
            .run(tokio_stream::iter(vec![paid("pay_404"), paid("pay_1")]))
            .await;

        assert_eq!(client.next_frame().await["type"], "payment_status_update");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_does_not_delay_other_results() {
        let manager = manager();
        let (sink, stream, _stalled) = stalled_connection();
        let stalled = manager.attach("pay_1", sink, stream).await;
        // fills the second slot; the next write to pay_1 blocks
        manager.push_error("pay_1", "filler", "filler").await.unwrap();
        let (_subscriber, mut client) = connect(&manager, "pay_2").await;

        manager
            .run(tokio_stream::iter(vec![paid("pay_1"), paid("pay_2")]))
            .await;

        let update = tokio::time::timeout(Duration::from_secs(1), client.next_frame())
            .await
            .unwrap();
        assert_eq!(update["paymentId"], "pay_2");

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(stalled.state(), SubscriberState::Closed);
        assert!(!manager.is_connected("pay_1"));
        assert_eq!(manager.stats().send_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_error_sends_error_frame() {
        let manager = manager();
        let (_subscriber, mut client) = connect(&manager, "pay_1").await;

        manager
            .push_error("pay_1", "payment_expired", "payment window closed")
            .await
            .unwrap();
        let frame = client.next_frame().await;
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["data"]["code"], "payment_expired");
    }

    // Read loop

    #[tokio::test(start_paused = true)]
    async fn client_ping_is_answered_with_pong() {
        let manager = manager();
        let (_subscriber, mut client) = connect(&manager, "pay_1").await;

        client.say(r#"{"type":"ping","paymentId":"pay_1"}"#);
        assert_eq!(client.next_frame().await["type"], "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_disconnect_removes_subscriber() {
        let manager = manager();
        let (subscriber, client) = connect(&manager, "pay_1").await;
        drop(client);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!manager.is_connected("pay_1"));
        assert!(subscriber.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_closes_connection() {
        let manager = manager();
        let (subscriber, client) = connect(&manager, "pay_1").await;
        client
            .to_server
            .unbounded_send(Err(NotifyError::Transport("reset".to_string())))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(subscriber.state(), SubscriberState::Closed);
        assert_eq!(manager.stats().read_errors, 1);
    }

    // Heartbeat

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_every_interval() {
        let manager = manager();
        let (_subscriber, mut client) = connect(&manager, "pay_1").await;

        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(client.next_frame().await["type"], "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_times_out() {
        let manager = manager();
        let (subscriber, mut client) = connect(&manager, "pay_3").await;

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert!(!manager.is_connected("pay_3"));
        assert_eq!(subscriber.state(), SubscriberState::Closed);
        assert_eq!(manager.stats().heartbeat_timeouts, 1);

        // pings went out before the timeout
        assert_eq!(client.next_frame().await["type"], "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn non_draining_silent_client_is_dropped() {
        let manager = manager();
        let (sink, stream, _stalled) = stalled_connection();
        let subscriber = manager.attach("pay_4", sink, stream).await;

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert!(!manager.is_connected("pay_4"));
        assert_eq!(subscriber.state(), SubscriberState::Closed);
        let stats = manager.stats();
        assert_eq!(stats.closed_connections, 1);
        assert_eq!(stats.send_errors + stats.heartbeat_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_connection_alive() {
        let manager = manager();
        let (_subscriber, mut client) = connect(&manager, "pay_1").await;

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(25)).await;
            client.say(r#"{"type":"pong"}"#);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.is_connected("pay_1"));
        assert_eq!(client.next_frame().await["type"], "ping");
    }

    // Close

    #[tokio::test(start_paused = true)]
    async fn close_is_idempotent() {
        let manager = manager();
        let (subscriber, _client) = connect(&manager, "pay_1").await;

        let (a, b) = tokio::join!(
            manager.close(&subscriber, CloseReason::HeartbeatTimeout),
            manager.close(&subscriber, CloseReason::ReadError),
        );
        assert!(a ^ b);
        assert!(!manager.close(&subscriber, CloseReason::Shutdown).await);

        let stats = manager.stats();
        assert_eq!(stats.closed_connections, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_subscriber_close_keeps_replacement() {
        let manager = manager();
        let (first, _client1) = connect(&manager, "pay_1").await;
        let (second, mut client2) = connect(&manager, "pay_1").await;

        manager.close(&first, CloseReason::HeartbeatTimeout).await;
        let current = manager.subscriber("pay_1").unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        manager.dispatch(&paid("pay_1")).await.unwrap();
        assert_eq!(client2.next_frame().await["type"], "payment_status_update");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_all() {
        let manager = manager();
        let (a, _c1) = connect(&manager, "pay_1").await;
        let (b, _c2) = connect(&manager, "pay_2").await;

        manager.close_all().await;
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(manager.stats().active_connections, 0);
    }
}
