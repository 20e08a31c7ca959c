use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Placeholder substituted with the configured API key.
pub const API_KEY_PLACEHOLDER: &str = "{api_key}";

/// A candidate upstream endpoint as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    /// Lower is tried first.
    pub priority: u32,
    pub handshake_timeout_ms: u64,
    #[serde(default)]
    pub requires_api_key: bool,
}

/// An endpoint the connector may actually dial, with its credential filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub url: String,
    pub handshake_timeout: Duration,
}

impl Endpoint {
    fn new(name: &str, url: &str, priority: u32, timeout_ms: u64, requires_api_key: bool) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            priority,
            handshake_timeout_ms: timeout_ms,
            requires_api_key,
        }
    }

    /// `None` when the endpoint needs a credential that is not configured.
    pub fn resolve(&self, api_key: Option<&str>) -> Option<Candidate> {
        let url = match (self.requires_api_key, api_key) {
            (true, None) => return None,
            (true, Some(key)) if key.trim().is_empty() => return None,
            (true, Some(key)) => self.url.replace(API_KEY_PLACEHOLDER, key.trim()),
            (false, _) => self.url.clone(),
        };
        Some(Candidate {
            name: self.name.clone(),
            url,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        })
    }
}

/// Usable candidates in ascending priority order. Ties keep configuration order.
pub fn rank(endpoints: &[Endpoint], api_key: Option<&str>) -> Vec<Candidate> {
    let mut sorted: Vec<&Endpoint> = endpoints.iter().collect();
    sorted.sort_by_key(|e| e.priority);
    sorted
        .into_iter()
        .filter_map(|e| e.resolve(api_key))
        .collect()
}

/// Public BSC websocket endpoints.
pub fn default_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new("Nariox BSC Node", "wss://bsc-ws-node.nariox.org/", 1, 5_000, false),
        Endpoint::new("Public Node BSC", "wss://bsc.publicnode.com/", 2, 5_000, false),
        Endpoint::new(
            "NodeReal BSC",
            "wss://bsc-mainnet.nodereal.io/ws/v1/{api_key}",
            3,
            8_000,
            true,
        ),
        Endpoint::new(
            "Binance BSC DataSeed",
            "wss://bsc-dataseed1.binance.org/ws/",
            4,
            10_000,
            false,
        ),
    ]
}
