//! Error types for expectation registration and resolution.

use thiserror::Error;

use crate::model::PaymentId;

/// Error returned by the [`MatchingEngine`](super::MatchingEngine) public API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("payment {0} is already registered")]
    DuplicateRegistration(PaymentId),

    #[error("unsupported token symbol {0}")]
    UnsupportedToken(String),

    #[error("payment {0} is not registered")]
    NotRegistered(PaymentId),
}
