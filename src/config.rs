//! Service configuration.
//!
//! Loaded from a TOML file (path in `PAYMENT_WATCH_CONFIG`, default
//! `config.toml`; a missing file means built-in defaults), then patched from
//! `PAYMENT_WATCH_*` environment variables, then validated. Any failure is
//! fatal at startup.

use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::feed::{BackoffPolicy, Candidate, Endpoint, FeedSettings, default_endpoints, rank};
use crate::model::{Address, TokenInfo, TokenRegistry};
use crate::notify::NotifierSettings;

pub const CONFIG_PATH_ENV: &str = "PAYMENT_WATCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const BIND_ENV: &str = "PAYMENT_WATCH_BIND";
const API_KEY_ENV: &str = "PAYMENT_WATCH_API_KEY";
const RECEIVERS_ENV: &str = "PAYMENT_WATCH_RECEIVERS";
const PAYMENT_TIMEOUT_ENV: &str = "PAYMENT_WATCH_PAYMENT_TIMEOUT_SECS";

const DEFAULT_TOKENS: [(&str, &str, u8); 3] = [
    ("USDT", "0x55d398326f99059fF775485246999027B3197955", 18),
    ("USDC", "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d", 18),
    ("BUSD", "0xe9e7CEA3DedcA5984780Bafc599bD69ADd087D56", 18),
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("no usable upstream endpoint configured")]
    NoEndpoints,
    #[error("no tokens configured")]
    NoTokens,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: SocketAddr,
    pub api_key: Option<String>,
    /// Receivers watched from startup, in addition to those of registered payments.
    pub receivers: Vec<Address>,
    pub payment_timeout_secs: u64,
    pub dispatch_capacity: usize,
    pub diagnostics_capacity: usize,
    pub endpoints: Vec<Endpoint>,
    pub tokens: Vec<TokenInfo>,
    pub feed: FeedConfig,
    pub notifier: NotifierSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub backoff: BackoffPolicy,
    pub liveness_interval_secs: u64,
    pub max_inflight_matches: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let settings = FeedSettings::default();
        Self {
            backoff: settings.backoff,
            liveness_interval_secs: settings.liveness_interval.as_secs(),
            max_inflight_matches: settings.max_inflight_matches,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_key: None,
            receivers: Vec::new(),
            payment_timeout_secs: 30 * 60,
            dispatch_capacity: crate::dispatch::DEFAULT_CAPACITY,
            diagnostics_capacity: crate::diagnostics::DEFAULT_CAPACITY,
            endpoints: default_endpoints(),
            tokens: default_tokens(),
            feed: FeedConfig::default(),
            notifier: NotifierSettings::default(),
        }
    }
}

/// The BSC stablecoins accepted out of the box.
pub fn default_tokens() -> Vec<TokenInfo> {
    DEFAULT_TOKENS
        .iter()
        .filter_map(|(symbol, contract, decimals)| {
            Some(TokenInfo {
                symbol: symbol.to_string(),
                contract: contract.parse().ok()?,
                decimals: *decimals,
            })
        })
        .collect()
}

/// Public API
impl Config {
    /// Load from the path in `PAYMENT_WATCH_CONFIG` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::load_from_path(&path)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file. A missing file yields the defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Patch fields from `lookup`, keyed by environment variable name.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(bind) = lookup(BIND_ENV) {
            self.bind = bind.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: BIND_ENV,
                reason: format!("{e}"),
            })?;
        }
        if let Some(api_key) = lookup(API_KEY_ENV) {
            let api_key = api_key.trim();
            self.api_key = (!api_key.is_empty()).then(|| api_key.to_string());
        }
        if let Some(receivers) = lookup(RECEIVERS_ENV) {
            self.receivers = receivers
                .trim()
                .trim_matches('"')
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| {
                    value.parse().map_err(|e| ConfigError::InvalidValue {
                        key: RECEIVERS_ENV,
                        reason: format!("{value}: {e}"),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(timeout) = lookup(PAYMENT_TIMEOUT_ENV) {
            self.payment_timeout_secs =
                timeout
                    .trim()
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: PAYMENT_TIMEOUT_ENV,
                        reason: format!("{e}"),
                    })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.candidates().is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.tokens.is_empty() {
            return Err(ConfigError::NoTokens);
        }
        let positive = [
            ("dispatch_capacity", self.dispatch_capacity as u64),
            ("diagnostics_capacity", self.diagnostics_capacity as u64),
            ("payment_timeout_secs", self.payment_timeout_secs),
            ("feed.max_inflight_matches", self.feed.max_inflight_matches as u64),
            ("feed.liveness_interval_secs", self.feed.liveness_interval_secs),
            ("feed.backoff.max_attempts", u64::from(self.feed.backoff.max_attempts)),
            ("notifier.ping_interval_secs", self.notifier.ping_interval.as_secs()),
            ("notifier.liveness_timeout_secs", self.notifier.liveness_timeout.as_secs()),
            ("notifier.write_timeout_secs", self.notifier.write_timeout.as_secs()),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        Ok(())
    }

    /// Endpoints the connector may dial, in priority order.
    pub fn candidates(&self) -> Vec<Candidate> {
        rank(&self.endpoints, self.api_key.as_deref())
    }

    pub fn token_registry(&self) -> TokenRegistry {
        TokenRegistry::new(self.tokens.iter().cloned())
    }

    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            backoff: self.feed.backoff,
            liveness_interval: Duration::from_secs(self.feed.liveness_interval_secs),
            max_inflight_matches: self.feed.max_inflight_matches,
        }
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_secs)
    }
}

/// `Duration` fields written as whole seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
