//! Client channel frames.
//!
//! Every frame is a JSON object `{type, paymentId, data, timestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::model::{Outcome, PaymentId};

/// Fractional digits used when rendering amounts to clients.
pub const AMOUNT_PRECISION: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ConnectionAck,
    PaymentStatusUpdate,
    Ping,
    Pong,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConnectionAck => "connection_ack",
            MessageType::PaymentStatusUpdate => "payment_status_update",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payment_id: PaymentId,
    #[serde(default)]
    pub data: Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ClientMessage {
    fn new(kind: MessageType, payment_id: &str, data: Value) -> Self {
        Self {
            kind,
            payment_id: payment_id.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn connection_ack(payment_id: &str, session_id: &str) -> Self {
        Self::new(
            MessageType::ConnectionAck,
            payment_id,
            json!({ "status": "connected", "sessionId": session_id }),
        )
    }

    /// Status update for a terminal outcome. `decimals` is the token's decimals,
    /// used to render a paid amount.
    pub fn status_update(payment_id: &str, outcome: &Outcome, decimals: u8) -> Self {
        let data = match outcome {
            Outcome::Paid(receipt) => json!({
                "status": outcome.status(),
                "transactionHash": receipt.tx_hash.to_string(),
                "blockNumber": receipt.block_number,
                "confirmations": receipt.confirmations,
                "amount": receipt.amount.to_decimal_string(decimals, AMOUNT_PRECISION),
                "token": receipt.token,
            }),
            Outcome::Failed { reason } => json!({
                "status": outcome.status(),
                "reason": reason,
            }),
            Outcome::TimedOut => json!({ "status": outcome.status() }),
        };
        Self::new(MessageType::PaymentStatusUpdate, payment_id, data)
    }

    pub fn ping(payment_id: &str) -> Self {
        Self::new(MessageType::Ping, payment_id, Value::Null)
    }

    pub fn pong(payment_id: &str) -> Self {
        Self::new(MessageType::Pong, payment_id, Value::Null)
    }

    pub fn error(payment_id: &str, code: &str, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            payment_id,
            json!({ "code": code, "message": message }),
        )
    }

    pub fn to_json(&self) -> String {
        // a struct of strings, numbers and a json value always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}
