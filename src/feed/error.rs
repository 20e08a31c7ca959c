use std::time::Duration;

use thiserror::Error;

/// Errors raised on the upstream feed connection.
///
/// None of these escape the connector: dial and read failures are retried with
/// backoff, decode failures drop the offending frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("failed to dial {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },

    #[error("handshake with {endpoint} timed out after {timeout:?}")]
    HandshakeTimeout { endpoint: String, timeout: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("feed is not connected")]
    NotConnected,

    #[error("malformed frame: {0}")]
    Decode(String),
}
