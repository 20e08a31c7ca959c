//! Payment matching engine.
//!
//! The engine keeps the registry of in-flight payment expectations and matches
//! decoded transfer events against it. Every expectation leaves the registry
//! exactly once, through one of three paths: a matching transfer, its deadline,
//! or an explicit cancel. Removal from the map under the write lock is the single
//! arbitration point between those paths; whoever removes the entry resolves it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use crate::Amount;
use crate::dispatch::ResultSender;
use crate::model::{
    Address, Outcome, PaymentId, Receipt, ResultRecord, TokenRegistry, TransferEvent,
};

mod state;
pub use state::Expectation;

mod error;
pub use error::EngineError;

/// Confirmation count reported on a matched transfer.
pub const CONFIRMATIONS: u32 = 1;

type Registry = Arc<RwLock<HashMap<PaymentId, Expectation>>>;

/// The payment matching engine.
///
/// Shared between the feed (which feeds it transfer events) and the gateway
/// (which registers expectations), typically behind an `Arc`.
pub struct MatchingEngine {
    expectations: Registry,
    tokens: Arc<TokenRegistry>,
    results: ResultSender,
    generation: AtomicU64,
}

/// Public API
impl MatchingEngine {
    pub fn new(tokens: Arc<TokenRegistry>, results: ResultSender) -> Self {
        Self {
            expectations: Arc::new(RwLock::new(HashMap::new())),
            tokens,
            results,
            generation: AtomicU64::new(0),
        }
    }

    /// Register a payment expectation and return the receiver its outcome is
    /// delivered on.
    ///
    /// A non-zero `timeout` arms a deadline that resolves the expectation as
    /// [`Outcome::TimedOut`] if it is still pending when the timer fires.
    pub fn register(
        &self,
        payment_id: impl Into<PaymentId>,
        token: &str,
        amount: Amount,
        receiver: Address,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, EngineError> {
        let payment_id = payment_id.into();
        let result = self.insert(&payment_id, token, amount, receiver, timeout);
        Self::log_result("register", &payment_id, token, Some(amount), &result);
        result
    }

    /// Resolve a pending expectation as [`Outcome::Failed`].
    pub fn cancel(&self, payment_id: &str, reason: &str) -> Result<(), EngineError> {
        let removed = self.expectations.write().remove(payment_id);
        let result = match removed {
            Some(exp) => {
                exp.resolve(Outcome::Failed {
                    reason: reason.to_string(),
                });
                Ok(())
            }
            None => Err(EngineError::NotRegistered(payment_id.to_string())),
        };
        Self::log_result("cancel", payment_id, "-", None, &result);
        result
    }

    /// Match a transfer against every pending expectation. Returns how many were resolved.
    ///
    /// Events from contracts outside the token table never match.
    pub fn on_transfer_event(&self, event: &TransferEvent) -> usize {
        let Some(symbol) = self.tokens.symbol_for(&event.token_contract) else {
            debug!(contract = %event.token_contract, tx = %event.tx_hash, "transfer from unknown token");
            return 0;
        };

        // scan under the read lock, claim under the write lock
        let candidates: Vec<(PaymentId, u64)> = self
            .expectations
            .read()
            .iter()
            .filter(|(_, exp)| exp.matches(symbol, event))
            .map(|(id, exp)| (id.clone(), exp.generation))
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let claimed: Vec<(PaymentId, Expectation)> = {
            let mut expectations = self.expectations.write();
            candidates
                .into_iter()
                .filter_map(|(id, generation)| {
                    Self::take_if(&mut expectations, &id, generation).map(|exp| (id, exp))
                })
                .collect()
        };

        let resolved = claimed.len();
        for (payment_id, exp) in claimed {
            let receipt = Receipt {
                sender: event.from,
                tx_hash: event.tx_hash,
                block_number: event.block_number,
                confirmations: CONFIRMATIONS,
                amount: event.amount,
                token: symbol.to_string(),
            };
            info!(
                payment_id = %payment_id,
                token = symbol,
                amount = %event.amount,
                tx = %event.tx_hash,
                block = event.block_number,
                "payment matched"
            );

            exp.resolve(Outcome::Paid(receipt.clone()));
            self.results.send(ResultRecord {
                payment_id,
                outcome: Outcome::Paid(receipt),
            });
        }
        resolved
    }

    /// Run the engine over a stream of transfer events.
    pub async fn run(&self, mut stream: impl Stream<Item = TransferEvent> + Unpin) {
        while let Some(event) = stream.next().await {
            self.on_transfer_event(&event);
        }
    }

    pub fn contains(&self, payment_id: &str) -> bool {
        self.expectations.read().contains_key(payment_id)
    }

    /// Number of pending expectations.
    pub fn len(&self) -> usize {
        self.expectations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.expectations.read().is_empty()
    }

    pub fn tokens(&self) -> &TokenRegistry {
        &self.tokens
    }
}

/// Private API
impl MatchingEngine {
    /// Small helper to log public API results
    fn log_result<T>(
        operation: &str,
        payment_id: &str,
        token: &str,
        amount: Option<Amount>,
        result: &Result<T, EngineError>,
    ) {
        match (result, amount) {
            (Ok(_), Some(amt)) => {
                info!(payment_id, token, amount = %amt, "{operation} applied");
            }
            (Ok(_), None) => {
                info!(payment_id, "{operation} applied");
            }
            (Err(e), Some(amt)) => {
                info!(payment_id, token, amount = %amt, reason = %e, "{operation} skipped");
            }
            (Err(e), None) => {
                info!(payment_id, reason = %e, "{operation} skipped");
            }
        }
    }

    /// Insert a new expectation:
    /// - Ensure the token is in the token table
    /// - Ensure the payment id is not already pending
    /// - Arm the deadline task when a timeout is given
    fn insert(
        &self,
        payment_id: &PaymentId,
        token: &str,
        amount: Amount,
        receiver: Address,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>, EngineError> {
        if self.tokens.by_symbol(token).is_none() {
            return Err(EngineError::UnsupportedToken(token.to_string()));
        }

        let (tx, rx) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let deadline = (!timeout.is_zero())
            .then(|| chrono::Duration::from_std(timeout).ok())
            .flatten()
            .map(|d| chrono::Utc::now() + d);

        {
            let mut expectations = self.expectations.write();
            if expectations.contains_key(payment_id) {
                return Err(EngineError::DuplicateRegistration(payment_id.clone()));
            }
            expectations.insert(
                payment_id.clone(),
                Expectation::new(token.to_string(), amount, receiver, deadline, generation, tx),
            );
        }

        if !timeout.is_zero() {
            self.arm_deadline(payment_id.clone(), generation, timeout);
        }

        Ok(rx)
    }

    /// Spawn the one-shot deadline task. It is a no-op if the expectation was
    /// already resolved, including when the id has since been registered again.
    fn arm_deadline(&self, payment_id: PaymentId, generation: u64, timeout: Duration) {
        let expectations = Arc::clone(&self.expectations);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = Self::take_if(&mut expectations.write(), &payment_id, generation);
            if let Some(exp) = expired {
                info!(payment_id = %payment_id, "expectation timed out");
                exp.resolve(Outcome::TimedOut);
            }
        });
    }

    /// Remove the entry only if it still belongs to the given registration.
    fn take_if(
        expectations: &mut HashMap<PaymentId, Expectation>,
        payment_id: &str,
        generation: u64,
    ) -> Option<Expectation> {
        match expectations.get(payment_id) {
            Some(exp) if exp.generation == generation => expectations.remove(payment_id),
            _ => None,
        }
    }
}
