pub mod amount;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod engine;
pub mod feed;
pub mod gateway;
pub mod model;
pub mod notify;
pub mod server;
pub mod store;

pub use amount::Amount;
pub use config::Config;
pub use engine::MatchingEngine;
pub use gateway::PaymentGateway;
pub use model::{Address, PaymentId, TransferEvent};
