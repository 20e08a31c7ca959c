//! Result dispatch channel.
//!
//! A bounded queue from the matching engine to the client notifier. Sending never
//! waits: when the queue is full the record is dropped, logged, and noted in the
//! diagnostics log.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::diagnostics::{DiagnosticsEntry, DiagnosticsLog, Direction};
use crate::model::ResultRecord;

pub const DEFAULT_CAPACITY: usize = 100;

/// Producer half of the dispatch channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ResultSender {
    tx: mpsc::Sender<ResultRecord>,
    diagnostics: Arc<DiagnosticsLog>,
}

pub type ResultReceiver = mpsc::Receiver<ResultRecord>;

/// Create a dispatch channel holding at most `capacity` pending records.
pub fn result_channel(
    capacity: usize,
    diagnostics: Arc<DiagnosticsLog>,
) -> (ResultSender, ResultReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ResultSender { tx, diagnostics }, rx)
}

impl ResultSender {
    /// Enqueue without blocking. Returns `false` when the record was dropped.
    pub fn send(&self, record: ResultRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                warn!(
                    payment_id = %record.payment_id,
                    status = record.outcome.status(),
                    "dispatch channel full, result dropped"
                );
                self.diagnostics.record(
                    DiagnosticsEntry::new(
                        "dispatch_dropped",
                        Direction::Outbound,
                        record.outcome.status(),
                    )
                    .with_payment(record.payment_id),
                );
                false
            }
            Err(TrySendError::Closed(record)) => {
                debug!(payment_id = %record.payment_id, "dispatch channel closed");
                false
            }
        }
    }
}
