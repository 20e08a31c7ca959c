use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::Amount;
use crate::model::{Address, Outcome, TransferEvent};

/// A pending payment waiting for a matching transfer.
///
/// The expectation owns the sending half of a one-shot channel, so resolving it
/// consumes it and the outcome can be delivered at most once.
#[derive(Debug)]
pub struct Expectation {
    pub token: String,
    pub amount: Amount,
    pub receiver: Address,
    pub registered_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Distinguishes successive registrations under the same payment id.
    pub(super) generation: u64,
    resolver: oneshot::Sender<Outcome>,
}

impl Expectation {
    pub(super) fn new(
        token: String,
        amount: Amount,
        receiver: Address,
        deadline: Option<DateTime<Utc>>,
        generation: u64,
        resolver: oneshot::Sender<Outcome>,
    ) -> Self {
        Self {
            token,
            amount,
            receiver,
            registered_at: Utc::now(),
            deadline,
            generation,
            resolver,
        }
    }

    /// Whether `event`, emitted by the contract of token `symbol`, settles this expectation.
    pub fn matches(&self, symbol: &str, event: &TransferEvent) -> bool {
        self.token == symbol && self.amount == event.amount && self.receiver == event.to
    }

    /// Deliver the outcome. Returns `false` if the waiting side was dropped.
    pub(super) fn resolve(self, outcome: Outcome) -> bool {
        self.resolver.send(outcome).is_ok()
    }
}
