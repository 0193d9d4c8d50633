//! Chain gateway
//!
//! Single boundary to the public ledger: the token contract and the proof
//! registry. Everything else in the workspace talks to the chain through
//! [`ChainGateway`].

pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod retry;

#[cfg(any(test, feature = "testkit"))]
pub mod simulated;

pub use client::{
    ChainClient, NetworkStatus, PublishBatch, ReceiptStatus, SignerIdentity, SigningKey,
    TokenInfo, TxReceipt,
};
pub use config::{ConfigError, GatewayConfig};
pub use errors::{ClientError, GatewayError, RevertReason};
pub use gateway::{ChainGateway, HealthReport, TransactionStatus};
pub use retry::{RetryError, RetryPolicy, Retryable};
