//! Payment persistence seam.
//!
//! The gateway only needs three calls from storage, captured by
//! [`PaymentStore`]. [`MemoryStore`] backs the binary and the tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::Amount;
use crate::model::{Address, BlockNumber, PaymentId, TxHash};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("payment {0} already exists")]
    Duplicate(PaymentId),
    #[error("payment {0} not found")]
    NotFound(PaymentId),
    #[error("payment {0} is already {1}")]
    AlreadyFinal(PaymentId, PaymentStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A payment session as persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub token: String,
    /// Smallest denomination, rendered as a decimal integer string.
    #[serde(serialize_with = "as_string")]
    pub amount: Amount,
    pub receiver: Address,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<BlockNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn as_string<S: serde::Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(amount)
}

impl PaymentRecord {
    /// A fresh pending payment expiring `timeout` from now.
    pub fn pending(
        payment_id: impl Into<PaymentId>,
        token: impl Into<String>,
        amount: Amount,
        receiver: Address,
        timeout: Duration,
    ) -> Self {
        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| created_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            payment_id: payment_id.into(),
            token: token.into(),
            amount,
            receiver,
            status: PaymentStatus::Pending,
            sender: None,
            transaction_hash: None,
            block_number: None,
            confirmed_at: None,
            created_at,
            expires_at,
        }
    }
}

/// Terminal status change for a payment.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: PaymentStatus,
    pub sender: Option<Address>,
    pub transaction_hash: Option<TxHash>,
    pub block_number: Option<BlockNumber>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            sender: None,
            transaction_hash: None,
            block_number: None,
            confirmed_at: None,
        }
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create_pending_payment(&self, record: PaymentRecord) -> Result<(), StoreError>;

    async fn get_payment_by_id(&self, payment_id: &str) -> Result<PaymentRecord, StoreError>;

    /// Move a pending payment to a final status. A payment only leaves
    /// `pending` once.
    async fn update_payment_status(
        &self,
        payment_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StoreError>;
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    payments: RwLock<HashMap<PaymentId, PaymentRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.payments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.read().is_empty()
    }
}

#[async_trait]
impl PaymentStore for MemoryStore {
    async fn create_pending_payment(&self, record: PaymentRecord) -> Result<(), StoreError> {
        let mut payments = self.payments.write();
        if payments.contains_key(&record.payment_id) {
            return Err(StoreError::Duplicate(record.payment_id));
        }
        debug!(payment_id = %record.payment_id, token = %record.token, "payment stored");
        payments.insert(record.payment_id.clone(), record);
        Ok(())
    }

    async fn get_payment_by_id(&self, payment_id: &str) -> Result<PaymentRecord, StoreError> {
        self.payments
            .read()
            .get(payment_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(payment_id.to_string()))
    }

    async fn update_payment_status(
        &self,
        payment_id: &str,
        update: StatusUpdate,
    ) -> Result<(), StoreError> {
        let mut payments = self.payments.write();
        let record = payments
            .get_mut(payment_id)
            .ok_or_else(|| StoreError::NotFound(payment_id.to_string()))?;
        if record.status.is_final() {
            return Err(StoreError::AlreadyFinal(
                payment_id.to_string(),
                record.status,
            ));
        }

        record.status = update.status;
        record.sender = update.sender.or(record.sender);
        record.transaction_hash = update.transaction_hash.or(record.transaction_hash);
        record.block_number = update.block_number.or(record.block_number);
        record.confirmed_at = update.confirmed_at.or(record.confirmed_at);
        debug!(payment_id, status = %record.status, "payment status updated");
        Ok(())
    }
}
