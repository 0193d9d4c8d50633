//! Account addresses on the public ledger
//!
//! Parsed from 0x-prefixed hex. Comparison is over raw bytes, so mixed-case
//! checksummed input matches its lowercase form.

use crate::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl FromStr for Address {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidAddress {
            value: s.to_string(),
        };
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .ok_or_else(invalid)?;
        if digits.len() != 40 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes).map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl TryFrom<String> for Address {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checksummed_address() {
        let addr: Address = "0xAeE3625b0E6a4FfAc196d4DCB51dCe7568dD6353".parse().unwrap();
        assert_eq!(
            addr.to_string(),
            "0xaee3625b0e6a4ffac196d4dcb51dce7568dd6353"
        );
    }

    #[test]
    fn test_mixed_case_addresses_are_equal() {
        let upper: Address = "0xAEE3625B0E6A4FFAC196D4DCB51DCE7568DD6353".parse().unwrap();
        let lower: Address = "0xaee3625b0e6a4ffac196d4dcb51dce7568dd6353".parse().unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn test_reject_malformed_addresses() {
        for bad in [
            "",
            "0x",
            "aee3625b0e6a4ffac196d4dcb51dce7568dd6353",
            "0xaee3625b0e6a4ffac196d4dcb51dce7568dd635",
            "0xgee3625b0e6a4ffac196d4dcb51dce7568dd6353",
        ] {
            assert!(bad.parse::<Address>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_zero_address() {
        assert!(Address::ZERO.is_zero());
        let parsed: Address = "0x0000000000000000000000000000000000000000".parse().unwrap();
        assert_eq!(parsed, Address::ZERO);
    }

    #[test]
    fn test_address_serde() {
        let addr = Address::from_bytes([0x11; 20]);
        let json = serde_json::to_string(&addr).unwrap();
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, back);
        assert!(serde_json::from_str::<Address>("\"0x11\"").is_err());
    }
}
