//! Bounded protocol log.
//!
//! Each connection side (upstream feed, client channel) owns one [`DiagnosticsLog`]
//! recording recent traffic. The log never grows past its capacity; once full the
//! oldest entries are evicted. Snapshots are copies, ordered oldest-first.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::model::PaymentId;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Longest payload summary kept per entry, in characters.
const MAX_SUMMARY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsEntry {
    pub category: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<PaymentId>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl DiagnosticsEntry {
    pub fn new(category: impl Into<String>, direction: Direction, summary: &str) -> Self {
        Self {
            category: category.into(),
            direction,
            payment_id: None,
            summary: truncate(summary),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payment(mut self, payment_id: impl Into<PaymentId>) -> Self {
        self.payment_id = Some(payment_id.into());
        self
    }
}

fn truncate(summary: &str) -> String {
    match summary.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((idx, _)) => format!("{}...", &summary[..idx]),
        None => summary.to_string(),
    }
}

/// Fixed-capacity ring buffer of [`DiagnosticsEntry`].
#[derive(Debug)]
pub struct DiagnosticsLog {
    capacity: usize,
    entries: Mutex<VecDeque<DiagnosticsEntry>>,
}

impl DiagnosticsLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn record(&self, entry: DiagnosticsEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Shorthand for `record(DiagnosticsEntry::new(..))`.
    pub fn note(&self, category: &str, direction: Direction, summary: &str) {
        self.record(DiagnosticsEntry::new(category, direction, summary));
    }

    /// Copy of the most recent `limit` entries, oldest-first. `limit == 0` returns all.
    pub fn snapshot(&self, limit: usize) -> Vec<DiagnosticsEntry> {
        let entries = self.entries.lock();
        let skip = match limit {
            0 => 0,
            n => entries.len().saturating_sub(n),
        };
        entries.iter().skip(skip).cloned().collect()
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
