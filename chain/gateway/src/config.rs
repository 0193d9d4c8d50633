//! Gateway configuration
//!
//! Loading is the host's job; this is the typed surface it fills in.
//! `from_env` covers the deployment variables the custody service uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use types::address::Address;
use types::errors::ValidationError;

use crate::client::{SignerIdentity, SigningKey};
use crate::retry::RetryPolicy;

pub const DEFAULT_RPC_URL: &str = "https://ethereum-sepolia-rpc.publicnode.com";
pub const DEFAULT_TOKEN_ADDRESS: &str = "0xAeE3625b0E6a4FfAc196d4DCB51dCe7568dD6353";
pub const DEFAULT_PROOF_REGISTRY_ADDRESS: &str = "0x4699ED32Ab75A7B7f8c74eAE88EF1EB02BFa55da";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: {source}")]
    InvalidValue {
        var: &'static str,
        source: ValidationError,
    },

    #[error("{present} is set but {missing} is not")]
    IncompleteSigner {
        present: &'static str,
        missing: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub rpc_endpoint: String,
    pub token_address: Address,
    pub proof_registry_address: Address,
    /// Absent: reads only, every write fails fast
    pub signer: Option<SignerIdentity>,
    /// Ceiling on any single network call
    pub call_timeout: Duration,
    /// Zero disables the read cache
    pub cache_ttl: Duration,
    /// Applied to cached reads; receipt polling brings its own policy
    pub read_retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: DEFAULT_RPC_URL.to_string(),
            token_address: Address::ZERO,
            proof_registry_address: Address::ZERO,
            signer: None,
            call_timeout: Duration::from_secs(15),
            cache_ttl: Duration::from_secs(5),
            read_retry: RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::default()
            },
        }
    }
}

impl GatewayConfig {
    /// Build from `ETH_RPC_URL`, `USDK_CONTRACT_ADDRESS`, `PROOF_REGISTRY_ADDRESS`,
    /// `CUSTODY_SIGNER_ADDRESS` and `CUSTODY_SIGNING_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let address = |name: &'static str, default: &str| -> Result<Address, ConfigError> {
            var(name)
                .as_deref()
                .unwrap_or(default)
                .parse()
                .map_err(|source| ConfigError::InvalidValue { var: name, source })
        };

        let signer = match (var("CUSTODY_SIGNER_ADDRESS"), var("CUSTODY_SIGNING_KEY")) {
            (Some(addr), Some(key)) => Some(SignerIdentity {
                address: addr.parse().map_err(|source| ConfigError::InvalidValue {
                    var: "CUSTODY_SIGNER_ADDRESS",
                    source,
                })?,
                key: SigningKey::new(key),
            }),
            (Some(_), None) => {
                return Err(ConfigError::IncompleteSigner {
                    present: "CUSTODY_SIGNER_ADDRESS",
                    missing: "CUSTODY_SIGNING_KEY",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteSigner {
                    present: "CUSTODY_SIGNING_KEY",
                    missing: "CUSTODY_SIGNER_ADDRESS",
                })
            }
            (None, None) => None,
        };

        Ok(Self {
            rpc_endpoint: var("ETH_RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            token_address: address("USDK_CONTRACT_ADDRESS", DEFAULT_TOKEN_ADDRESS)?,
            proof_registry_address: address(
                "PROOF_REGISTRY_ADDRESS",
                DEFAULT_PROOF_REGISTRY_ADDRESS,
            )?,
            signer,
            ..Self::default()
        })
    }
}
