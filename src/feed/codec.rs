//! JSON-RPC framing for the upstream log feed.
//!
//! Outbound: `eth_subscribe` log subscriptions and `net_version` keep-alive probes.
//! Inbound: replies (`{id, result}` or `{id, error}`) and subscription
//! notifications carrying ERC-20 `Transfer` logs.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};

use super::FeedError;
use crate::Amount;
use crate::model::{Address, BlockNumber, TransferEvent, TxHash};

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Reply to one of our subscribe requests.
    SubscriptionAck {
        request_id: u64,
        contract: Address,
        subscription: String,
    },
    Transfer(TransferEvent),
    /// Any other successful reply, e.g. to a keep-alive probe.
    Reply { id: Option<u64> },
    RpcError {
        id: Option<u64>,
        code: i64,
        message: String,
    },
    /// Well-formed but irrelevant, such as a log removed by a reorg.
    Ignored { reason: String },
}

#[derive(Debug, Deserialize)]
struct Inbound {
    id: Option<u64>,
    method: Option<String>,
    result: Option<Value>,
    error: Option<RpcErrorBody>,
    params: Option<NotificationParams>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct NotificationParams {
    result: LogEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    address: String,
    topics: Vec<String>,
    data: String,
    transaction_hash: String,
    block_number: String,
    #[serde(default)]
    removed: bool,
}

/// Builds `eth_subscribe` for Transfer logs of `contract` sent to any of `receivers`.
/// An empty receiver set subscribes to every transfer of the token.
pub fn subscribe_request(id: u64, contract: &Address, receivers: &[Address]) -> String {
    let to_filter = match receivers {
        [] => Value::Null,
        [single] => Value::String(single.to_topic()),
        many => Value::Array(many.iter().map(|r| Value::String(r.to_topic())).collect()),
    };
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "eth_subscribe",
        "params": [
            "logs",
            {
                "address": contract.to_string(),
                "topics": [TRANSFER_TOPIC, Value::Null, to_filter],
            }
        ],
    })
    .to_string()
}

/// Builds `eth_unsubscribe` for a subscription id returned by an earlier ack.
pub fn unsubscribe_request(id: u64, subscription: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "eth_unsubscribe",
        "params": [subscription],
    })
    .to_string()
}

pub fn keep_alive_request(id: u64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "net_version",
        "params": [],
    })
    .to_string()
}

/// Stateful decoder: remembers which request ids were subscribe requests so the
/// matching replies can be recognised as acknowledgements.
#[derive(Debug, Default)]
pub struct Decoder {
    pending: Mutex<HashMap<u64, Address>>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_ack(&self, request_id: u64, contract: Address) {
        self.pending.lock().insert(request_id, contract);
    }

    /// Forget outstanding subscribe requests, e.g. after a reconnect.
    pub fn reset(&self) {
        self.pending.lock().clear();
    }

    pub fn decode(&self, text: &str) -> Result<Frame, FeedError> {
        let inbound: Inbound =
            serde_json::from_str(text).map_err(|e| FeedError::Decode(e.to_string()))?;

        if let Some(method) = inbound.method.as_deref() {
            if !method.ends_with("subscription") {
                return Ok(Frame::Ignored {
                    reason: format!("unexpected method {method}"),
                });
            }
            let params = inbound
                .params
                .ok_or_else(|| FeedError::Decode("notification without params".to_string()))?;
            if params.result.removed {
                return Ok(Frame::Ignored {
                    reason: format!("log {} removed", params.result.transaction_hash),
                });
            }
            return decode_transfer(&params.result).map(Frame::Transfer);
        }

        if let Some(error) = inbound.error {
            if let Some(id) = inbound.id {
                self.pending.lock().remove(&id);
            }
            return Ok(Frame::RpcError {
                id: inbound.id,
                code: error.code,
                message: error.message,
            });
        }

        if inbound.id.is_none() && inbound.result.is_none() {
            return Err(FeedError::Decode("frame has neither id nor method".to_string()));
        }
        let contract = inbound.id.and_then(|id| self.pending.lock().remove(&id));
        match (inbound.id, contract, inbound.result) {
            (Some(request_id), Some(contract), Some(Value::String(subscription))) => {
                Ok(Frame::SubscriptionAck {
                    request_id,
                    contract,
                    subscription,
                })
            }
            (id, _, _) => Ok(Frame::Reply { id }),
        }
    }
}

fn decode_transfer(log: &LogEntry) -> Result<TransferEvent, FeedError> {
    let [topic0, from, to, ..] = log.topics.as_slice() else {
        return Err(FeedError::Decode(format!(
            "transfer log needs 3 topics, got {}",
            log.topics.len()
        )));
    };
    if !topic0.eq_ignore_ascii_case(TRANSFER_TOPIC) {
        return Err(FeedError::Decode(format!("not a transfer log: {topic0}")));
    }

    Ok(TransferEvent {
        from: Address::from_topic(from).map_err(|e| malformed("from", e))?,
        to: Address::from_topic(to).map_err(|e| malformed("to", e))?,
        amount: Amount::from_hex(&log.data).map_err(|e| malformed("data", e))?,
        token_contract: log
            .address
            .parse::<Address>()
            .map_err(|e| malformed("address", e))?,
        tx_hash: log
            .transaction_hash
            .parse::<TxHash>()
            .map_err(|e| malformed("transactionHash", e))?,
        block_number: parse_quantity(&log.block_number)
            .map_err(|e| malformed("blockNumber", e))?,
    })
}

fn malformed(field: &str, err: impl std::fmt::Display) -> FeedError {
    FeedError::Decode(format!("{field}: {err}"))
}

fn parse_quantity(value: &str) -> Result<BlockNumber, std::num::ParseIntError> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    BlockNumber::from_str_radix(digits, 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    // test utils

    const USDT: &str = "0x55d398326f99059ff775485246999027b3197955";
    const RECEIVER: &str = "0x00000000000000000000000000000000000000ab";
    const SENDER: &str = "0x00000000000000000000000000000000000000cd";
    const TX: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn topic(addr: &str) -> String {
        addr.parse::<Address>().unwrap().to_topic()
    }

    fn notification(topics: Vec<String>, data: &str) -> String {
        json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0xsub",
                "result": {
                    "address": USDT,
                    "topics": topics,
                    "data": data,
                    "transactionHash": TX,
                    "blockNumber": "0x2a",
                    "logIndex": "0x0",
                }
            }
        })
        .to_string()
    }

    // Outbound

    #[test]
    fn subscribe_request_filters_on_receiver_topic() {
        let contract: Address = USDT.parse().unwrap();
        let receiver: Address = RECEIVER.parse().unwrap();
        let frame: Value =
            serde_json::from_str(&subscribe_request(7, &contract, &[receiver])).unwrap();

        assert_eq!(frame["method"], "eth_subscribe");
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["params"][0], "logs");
        assert_eq!(frame["params"][1]["address"], USDT);
        assert_eq!(frame["params"][1]["topics"][0], TRANSFER_TOPIC);
        assert!(frame["params"][1]["topics"][1].is_null());
        assert_eq!(frame["params"][1]["topics"][2], topic(RECEIVER));
    }

    #[test]
    fn subscribe_request_with_many_receivers_uses_or_list() {
        let contract: Address = USDT.parse().unwrap();
        let receivers = [RECEIVER.parse().unwrap(), SENDER.parse().unwrap()];
        let frame: Value =
            serde_json::from_str(&subscribe_request(1, &contract, &receivers)).unwrap();
        assert_eq!(frame["params"][1]["topics"][2].as_array().unwrap().len(), 2);
    }

    #[test]
    fn keep_alive_is_net_version() {
        let frame: Value = serde_json::from_str(&keep_alive_request(3)).unwrap();
        assert_eq!(frame["method"], "net_version");
        assert_eq!(frame["params"], json!([]));
        assert_eq!(frame["id"], 3);
    }

    #[test]
    fn unsubscribe_request_names_subscription() {
        let frame: Value = serde_json::from_str(&unsubscribe_request(9, "0xabc")).unwrap();
        assert_eq!(frame["method"], "eth_unsubscribe");
        assert_eq!(frame["params"], json!(["0xabc"]));
        assert_eq!(frame["id"], 9);
    }

    // Inbound

    #[test]
    fn decode_transfer_notification() {
        let decoder = Decoder::new();
        let text = notification(
            vec![TRANSFER_TOPIC.to_string(), topic(SENDER), topic(RECEIVER)],
            "0x0000000000000000000000000000000000000000000000008ac7230489e80000",
        );

        let Frame::Transfer(event) = decoder.decode(&text).unwrap() else {
            panic!("expected transfer");
        };
        assert_eq!(event.from, SENDER.parse().unwrap());
        assert_eq!(event.to, RECEIVER.parse().unwrap());
        assert_eq!(
            event.amount,
            Amount::from_base_units(10_000_000_000_000_000_000)
        );
        assert_eq!(event.token_contract, USDT.parse().unwrap());
        assert_eq!(event.tx_hash, TX.parse().unwrap());
        assert_eq!(event.block_number, 42);
    }

    #[test]
    fn decode_subscription_ack_only_for_pending_requests() {
        let decoder = Decoder::new();
        let contract: Address = USDT.parse().unwrap();
        decoder.expect_ack(5, contract);

        let ack = decoder
            .decode(r#"{"jsonrpc":"2.0","id":5,"result":"0xabc"}"#)
            .unwrap();
        assert_eq!(
            ack,
            Frame::SubscriptionAck {
                request_id: 5,
                contract,
                subscription: "0xabc".to_string()
            }
        );

        // same id again is just a reply
        let reply = decoder
            .decode(r#"{"jsonrpc":"2.0","id":5,"result":"0xabc"}"#)
            .unwrap();
        assert_eq!(reply, Frame::Reply { id: Some(5) });
    }

    #[test]
    fn decode_keep_alive_reply() {
        let decoder = Decoder::new();
        let frame = decoder
            .decode(r#"{"jsonrpc":"2.0","id":9,"result":"56"}"#)
            .unwrap();
        assert_eq!(frame, Frame::Reply { id: Some(9) });
    }

    #[test]
    fn decode_rpc_error() {
        let decoder = Decoder::new();
        let frame = decoder
            .decode(r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"nope"}}"#)
            .unwrap();
        assert_eq!(
            frame,
            Frame::RpcError {
                id: Some(2),
                code: -32601,
                message: "nope".to_string()
            }
        );
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let decoder = Decoder::new();
        assert!(matches!(decoder.decode("not json"), Err(FeedError::Decode(_))));
        assert!(matches!(
            decoder.decode(r#"{"jsonrpc":"2.0"}"#),
            Err(FeedError::Decode(_))
        ));

        let short = notification(vec![TRANSFER_TOPIC.to_string()], "0x01");
        assert!(matches!(decoder.decode(&short), Err(FeedError::Decode(_))));

        let wrong_topic = notification(
            vec![topic(SENDER), topic(SENDER), topic(RECEIVER)],
            "0x01",
        );
        assert!(matches!(decoder.decode(&wrong_topic), Err(FeedError::Decode(_))));

        let bad_data = notification(
            vec![TRANSFER_TOPIC.to_string(), topic(SENDER), topic(RECEIVER)],
            "0xnothex",
        );
        assert!(matches!(decoder.decode(&bad_data), Err(FeedError::Decode(_))));
    }

    #[test]
    fn decode_ignores_removed_logs() {
        let decoder = Decoder::new();
        let mut frame: Value = serde_json::from_str(&notification(
            vec![TRANSFER_TOPIC.to_string(), topic(SENDER), topic(RECEIVER)],
            "0x01",
        ))
        .unwrap();
        frame["params"]["result"]["removed"] = Value::Bool(true);

        assert!(matches!(
            decoder.decode(&frame.to_string()).unwrap(),
            Frame::Ignored { .. }
        ));
    }
}
