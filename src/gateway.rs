//! Service root.
//!
//! [`PaymentGateway`] owns one of each component and wires them together:
//! the feed pushes transfer events into the engine, the engine resolves
//! expectations and enqueues results, the notifier drains results to clients,
//! and a monitor task per payment writes the outcome to the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::amount::AmountError;
use crate::config::Config;
use crate::diagnostics::{DiagnosticsEntry, DiagnosticsLog};
use crate::dispatch::{ResultReceiver, ResultSender, result_channel};
use crate::engine::{CONFIRMATIONS, EngineError, MatchingEngine};
use crate::feed::{Dialer, FeedConnector, FeedStats};
use crate::model::{Address, HexValueError, Outcome, PaymentId, Receipt, ResultRecord, TokenRegistry};
use crate::notify::{ClientSink, ClientStats, ClientStream, NotificationManager, Subscriber};
use crate::store::{PaymentRecord, PaymentStatus, PaymentStore, StatusUpdate, StoreError};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid amount: {0}")]
    Amount(#[from] AmountError),
    #[error("invalid receiver address: {0}")]
    Receiver(#[from] HexValueError),
    #[error("no receiver address given and none configured")]
    NoReceiver,
}

/// Request to open a payment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPayment {
    pub token: String,
    /// Decimal amount in whole tokens, e.g. `"10.5"`.
    pub amount: String,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    #[serde(rename = "blockchain")]
    pub upstream: FeedStats,
    #[serde(rename = "frontend")]
    pub clients: ClientStats,
    pub pending_payments: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticsSource {
    Blockchain,
    Frontend,
}

/// A diagnostics entry tagged with the buffer it came from.
#[derive(Debug, Clone, Serialize)]
pub struct TaggedEntry {
    pub source: DiagnosticsSource,
    #[serde(flatten)]
    pub entry: DiagnosticsEntry,
}

pub struct PaymentGateway {
    engine: Arc<MatchingEngine>,
    feed: Arc<FeedConnector>,
    notifier: Arc<NotificationManager>,
    store: Arc<dyn PaymentStore>,
    results: ResultSender,
    tokens: Arc<TokenRegistry>,
    receivers: Vec<Address>,
    payment_timeout: Duration,
    shutdown: CancellationToken,
}

/// Public API
impl PaymentGateway {
    /// Build every component from `config`. The returned receiver is the
    /// consuming end of the result channel, handed back to [`Self::start`].
    pub fn new(
        config: &Config,
        dialer: Arc<dyn Dialer>,
        store: Arc<dyn PaymentStore>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, ResultReceiver) {
        let tokens = Arc::new(config.token_registry());
        let upstream_log = Arc::new(DiagnosticsLog::new(config.diagnostics_capacity));
        let client_log = Arc::new(DiagnosticsLog::new(config.diagnostics_capacity));

        let (results, receiver) = result_channel(config.dispatch_capacity, Arc::clone(&upstream_log));
        let engine = Arc::new(MatchingEngine::new(Arc::clone(&tokens), results.clone()));
        let feed = Arc::new(FeedConnector::new(
            config.candidates(),
            config.feed_settings(),
            dialer,
            Arc::clone(&engine),
            upstream_log,
            shutdown.clone(),
        ));
        feed.watch_receivers(config.receivers.iter().copied());
        let notifier = Arc::new(NotificationManager::new(
            Arc::clone(&tokens),
            config.notifier,
            client_log,
            shutdown.clone(),
        ));

        let gateway = Arc::new(Self {
            engine,
            feed,
            notifier,
            store,
            results,
            tokens,
            receivers: config.receivers.clone(),
            payment_timeout: config.payment_timeout(),
            shutdown,
        });
        (gateway, receiver)
    }

    /// Start draining results to clients and connecting upstream.
    pub fn start(self: &Arc<Self>, results: ResultReceiver) {
        let notifier = Arc::clone(&self.notifier);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = notifier.run(ReceiverStream::new(results)) => {}
            }
            debug!("result dispatch stopped");
        });
        self.feed.start();
        info!(tokens = self.tokens.iter().count(), "gateway started");
    }

    /// Persist a new pending payment and start watching for it.
    pub async fn create_payment(
        self: &Arc<Self>,
        request: NewPayment,
    ) -> Result<PaymentRecord, GatewayError> {
        let token = self
            .tokens
            .by_symbol(&request.token)
            .ok_or_else(|| EngineError::UnsupportedToken(request.token.clone()))?;
        let amount = Amount::parse_decimal(&request.amount, token.decimals)?;
        let receiver = match request.receiver.as_deref() {
            Some(raw) => raw.parse::<Address>()?,
            None => self
                .receivers
                .first()
                .copied()
                .ok_or(GatewayError::NoReceiver)?,
        };
        let timeout = request
            .timeout_secs
            .map_or(self.payment_timeout, Duration::from_secs);

        let payment_id = new_payment_id();
        let record = PaymentRecord::pending(
            payment_id.clone(),
            token.symbol.clone(),
            amount,
            receiver,
            timeout,
        );
        self.store.create_pending_payment(record.clone()).await?;

        if let Err(e) = self
            .register_expectation_and_monitor(payment_id.clone(), &token.symbol, amount, receiver, timeout)
            .await
        {
            self.mark_failed(&payment_id).await;
            return Err(e.into());
        }
        Ok(record)
    }

    /// Register an expectation, widen the upstream filter to its receiver, and
    /// spawn the task that persists its outcome. Subscriptions are only re-sent
    /// when the receiver is new to the filter.
    pub async fn register_expectation_and_monitor(
        self: &Arc<Self>,
        payment_id: PaymentId,
        token: &str,
        amount: Amount,
        receiver: Address,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let resolution = self
            .engine
            .register(payment_id.clone(), token, amount, receiver, timeout)?;

        if self.feed.watch_receiver(receiver) {
            debug!(receiver = %receiver, "receiver added to upstream filter");
            self.feed.resubscribe_all().await;
        }

        tokio::spawn(Arc::clone(self).monitor(payment_id, resolution));
        Ok(())
    }

    /// Abandon a pending payment. The client and the store see `failed`.
    pub fn cancel_payment(&self, payment_id: &str, reason: &str) -> Result<(), EngineError> {
        self.engine.cancel(payment_id, reason)
    }

    pub async fn payment(&self, payment_id: &str) -> Result<PaymentRecord, StoreError> {
        self.store.get_payment_by_id(payment_id).await
    }

    /// Adopt a client connection for an existing payment. A payment that has
    /// already settled is reported immediately. The status is read after the
    /// subscriber is registered, so a result that lands in between is never lost.
    pub async fn attach_client(
        &self,
        payment_id: &str,
        sink: ClientSink,
        stream: ClientStream,
    ) -> Arc<Subscriber> {
        let subscriber = self.notifier.attach(payment_id, sink, stream).await;
        let record = match self.store.get_payment_by_id(payment_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(payment_id, error = %e, "payment lookup after attach failed");
                return subscriber;
            }
        };
        if let Some(outcome) = settled_outcome(&record) {
            let _ = self
                .notifier
                .dispatch(&ResultRecord {
                    payment_id: record.payment_id,
                    outcome,
                })
                .await;
        }
        subscriber
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            upstream: self.feed.stats(),
            clients: self.notifier.stats(),
            pending_payments: self.engine.len(),
        }
    }

    /// Most recent protocol entries from both buffers, newest first.
    pub fn recent_diagnostics(&self, limit: usize) -> Vec<TaggedEntry> {
        let mut entries: Vec<TaggedEntry> = tagged(DiagnosticsSource::Blockchain, self.feed.diagnostics())
            .chain(tagged(DiagnosticsSource::Frontend, self.notifier.diagnostics()))
            .collect();
        entries.sort_by(|a, b| b.entry.timestamp.cmp(&a.entry.timestamp));
        entries.truncate(limit);
        entries
    }

    pub fn is_upstream_connected(&self) -> bool {
        self.feed.is_connected()
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    pub fn feed(&self) -> &Arc<FeedConnector> {
        &self.feed
    }

    pub fn notifier(&self) -> &Arc<NotificationManager> {
        &self.notifier
    }

    /// Stop background work and close every connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.notifier.close_all().await;
        self.feed.close().await;
        info!("gateway stopped");
    }
}

/// Private API
impl PaymentGateway {
    /// Roll back a payment whose registration failed.
    async fn mark_failed(&self, payment_id: &str) {
        let update = StatusUpdate::status(PaymentStatus::Failed);
        if let Err(e) = self.store.update_payment_status(payment_id, update).await {
            warn!(payment_id, error = %e, "failed to mark payment failed");
        }
    }

    async fn monitor(self: Arc<Self>, payment_id: PaymentId, resolution: oneshot::Receiver<Outcome>) {
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            outcome = resolution => match outcome {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(payment_id = %payment_id, "expectation dropped unresolved");
                    return;
                }
            },
        };

        let update = match &outcome {
            Outcome::Paid(receipt) => StatusUpdate {
                status: PaymentStatus::Paid,
                sender: Some(receipt.sender),
                transaction_hash: Some(receipt.tx_hash),
                block_number: Some(receipt.block_number),
                confirmed_at: Some(Utc::now()),
            },
            Outcome::TimedOut => StatusUpdate::status(PaymentStatus::Expired),
            Outcome::Failed { .. } => StatusUpdate::status(PaymentStatus::Failed),
        };
        match self.store.update_payment_status(&payment_id, update).await {
            Ok(()) => info!(payment_id = %payment_id, status = outcome.status(), "payment settled"),
            Err(e) => warn!(payment_id = %payment_id, error = %e, "failed to persist payment status"),
        }

        // the engine already enqueued paid results
        if !matches!(outcome, Outcome::Paid(_)) {
            self.results.send(ResultRecord {
                payment_id,
                outcome,
            });
        }
    }
}

fn tagged(source: DiagnosticsSource, log: &DiagnosticsLog) -> impl Iterator<Item = TaggedEntry> {
    log.snapshot(0)
        .into_iter()
        .map(move |entry| TaggedEntry { source, entry })
}

fn new_payment_id() -> PaymentId {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("pay_{}", &id[..16])
}

/// Terminal outcome recorded for a payment, if it has one.
fn settled_outcome(record: &PaymentRecord) -> Option<Outcome> {
    match record.status {
        PaymentStatus::Pending => None,
        PaymentStatus::Expired => Some(Outcome::TimedOut),
        PaymentStatus::Failed => Some(Outcome::Failed {
            reason: "payment failed".to_string(),
        }),
        PaymentStatus::Paid => Some(Outcome::Paid(Receipt {
            sender: record.sender.unwrap_or_default(),
            tx_hash: record.transaction_hash.unwrap_or_default(),
            block_number: record.block_number.unwrap_or_default(),
            confirmations: CONFIRMATIONS,
            amount: record.amount,
            token: record.token.clone(),
        })),
    }
}
