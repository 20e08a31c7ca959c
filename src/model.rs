//! Core domain types shared by the feed, the matching engine and the notifier.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Amount;

/// Payment identifier, e.g. `pay_3f9a0c1d2e4b5a6c`.
pub type PaymentId = String;

/// Block height on the watched chain.
pub type BlockNumber = u64;

/// Errors produced while parsing fixed-width hex values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexValueError {
    #[error("'{0}' is not valid hex")]
    InvalidHex(String),
    #[error("'{value}' has {actual} bytes, expected {expected}")]
    InvalidLength {
        value: String,
        expected: usize,
        actual: usize,
    },
}

fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], HexValueError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    let bytes = hex::decode(digits).map_err(|_| HexValueError::InvalidHex(value.to_string()))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| HexValueError::InvalidLength {
        value: value.to_string(),
        expected: N,
        actual: bytes.len(),
    })
}

/// A 20-byte account or contract address. Parsing is case-insensitive, so
/// checksummed and lowercase spellings compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Extract an address from a 32-byte log topic (left-padded with zeros).
    pub fn from_topic(topic: &str) -> Result<Self, HexValueError> {
        let word = decode_fixed::<32>(topic)?;
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&word[12..]);
        Ok(Address(bytes))
    }

    /// Left-pad to a 32-byte topic word, as used in log subscription filters.
    pub fn to_topic(&self) -> String {
        format!("0x{}{}", "0".repeat(24), hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = HexValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<20>(s.trim()).map(Address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A 32-byte transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxHash([u8; 32]);

impl TxHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        TxHash(bytes)
    }
}

impl FromStr for TxHash {
    type Err = HexValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_fixed::<32>(s.trim()).map(TxHash)
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

impl Serialize for TxHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A decoded ERC-20 `Transfer` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub from: Address,
    pub to: Address,
    pub amount: Amount,
    /// Contract that emitted the log.
    pub token_contract: Address,
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
}

/// Details of a transfer that settled a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub sender: Address,
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
    pub confirmations: u32,
    pub amount: Amount,
    pub token: String,
}

/// Terminal outcome of a payment expectation, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Paid(Receipt),
    Failed { reason: String },
    TimedOut,
}

impl Outcome {
    /// Status label used on the client channel and in persistence.
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Paid(_) => "paid",
            Outcome::Failed { .. } => "failed",
            Outcome::TimedOut => "expired",
        }
    }
}

/// An outcome addressed to the subscriber of one payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub payment_id: PaymentId,
    pub outcome: Outcome,
}

/// A token the gateway accepts payments in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub contract: Address,
    pub decimals: u8,
}

/// Bidirectional symbol/contract lookup over the configured tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    by_symbol: HashMap<String, TokenInfo>,
    by_contract: HashMap<Address, String>,
}

impl TokenRegistry {
    pub fn new(tokens: impl IntoIterator<Item = TokenInfo>) -> Self {
        let mut registry = TokenRegistry::default();
        for token in tokens {
            registry
                .by_contract
                .insert(token.contract, token.symbol.clone());
            registry.by_symbol.insert(token.symbol.clone(), token);
        }
        registry
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&TokenInfo> {
        self.by_symbol.get(symbol)
    }

    pub fn symbol_for(&self, contract: &Address) -> Option<&str> {
        self.by_contract.get(contract).map(String::as_str)
    }

    pub fn decimals_of(&self, symbol: &str) -> Option<u8> {
        self.by_symbol.get(symbol).map(|t| t.decimals)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenInfo> + '_ {
        self.by_symbol.values()
    }
}
