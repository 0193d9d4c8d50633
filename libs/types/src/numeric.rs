//! Arbitrary-precision token amounts
//!
//! Token amounts are unsigned integers in base units (wei-style, 18 decimals
//! for USDK) and can exceed any machine integer. `Amount` wraps `BigUint` and
//! serializes as a decimal string so JSON stays lossless. Signed balances are
//! plain `BigInt`.

use crate::errors::ValidationError;
use num_bigint::{BigInt, BigUint};
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// Non-negative token amount in base units
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Amount(BigUint);

impl Amount {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn from_biguint(value: BigUint) -> Self {
        Self(value)
    }

    pub fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Parse a user-supplied amount, rejecting zero and anything wider than 256 bits.
    pub fn parse_positive(s: &str) -> Result<Self, ValidationError> {
        let amount: Amount = s.parse()?;
        if amount.is_zero() {
            return Err(ValidationError::ZeroAmount);
        }
        amount.to_be_bytes32()?;
        Ok(amount)
    }

    pub fn checked_sub(&self, other: &Amount) -> Option<Amount> {
        if self.0 < other.0 {
            None
        } else {
            Some(Amount(&self.0 - &other.0))
        }
    }

    pub fn saturating_sub(&self, other: &Amount) -> Amount {
        self.checked_sub(other).unwrap_or_default()
    }

    /// Signed view, for balance arithmetic.
    pub fn to_signed(&self) -> BigInt {
        BigInt::from(self.0.clone())
    }

    pub fn to_u128(&self) -> Option<u128> {
        self.0.to_u128()
    }

    /// 32-byte big-endian encoding (uint256 layout).
    pub fn to_be_bytes32(&self) -> Result<[u8; 32], ValidationError> {
        let raw = self.0.to_bytes_be();
        if raw.len() > 32 {
            return Err(ValidationError::AmountOverflow);
        }
        let mut out = [0u8; 32];
        out[32 - raw.len()..].copy_from_slice(&raw);
        Ok(out)
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(BigUint::from_bytes_be(bytes))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Self(BigUint::from(value))
    }
}

impl FromStr for Amount {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidAmount {
                value: s.to_string(),
            });
        }
        BigUint::from_str(s)
            .map(Self)
            .map_err(|_| ValidationError::InvalidAmount {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Amount {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.to_string()
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for &'a Amount {
    type Output = Amount;

    fn add(self, rhs: &'a Amount) -> Amount {
        Amount(&self.0 + &rhs.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |acc, a| acc + a)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.fold(Amount::zero(), |mut acc, a| {
            acc += a;
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_large_amount() {
        // 10^30: beyond u64 and beyond a 96-bit decimal mantissa
        let amount: Amount = "1000000000000000000000000000000".parse().unwrap();
        assert_eq!(amount.to_string(), "1000000000000000000000000000000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "-5", "1.5", "12a", " 7", "+3"] {
            assert!(bad.parse::<Amount>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_parse_positive_rejects_zero() {
        assert_eq!(Amount::parse_positive("0"), Err(ValidationError::ZeroAmount));
        assert!(Amount::parse_positive("100").is_ok());
    }

    #[test]
    fn test_parse_positive_rejects_overflow() {
        let too_big = (BigUint::from(1u8) << 256u32).to_string();
        assert_eq!(
            Amount::parse_positive(&too_big),
            Err(ValidationError::AmountOverflow)
        );
        let max = ((BigUint::from(1u8) << 256u32) - 1u8).to_string();
        assert!(Amount::parse_positive(&max).is_ok());
    }

    #[test]
    fn test_be_bytes32_layout() {
        let bytes = Amount::from(0x0102u64).to_be_bytes32().unwrap();
        assert_eq!(bytes[30], 0x01);
        assert_eq!(bytes[31], 0x02);
        assert!(bytes[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_checked_sub() {
        let a = Amount::from(100u64);
        let b = Amount::from(30u64);
        assert_eq!(a.checked_sub(&b), Some(Amount::from(70u64)));
        assert_eq!(b.checked_sub(&a), None);
        assert_eq!(b.saturating_sub(&a), Amount::zero());
    }

    #[test]
    fn test_sum_and_json() {
        let total: Amount = [1u64, 2, 3].into_iter().map(Amount::from).sum();
        assert_eq!(total, Amount::from(6u64));
        let json = serde_json::to_string(&total).unwrap();
        assert_eq!(json, "\"6\"");
    }

    proptest! {
        #[test]
        fn prop_be_bytes_roundtrip(value in any::<u128>()) {
            let amount = Amount::from(value);
            let bytes = amount.to_be_bytes32().unwrap();
            prop_assert_eq!(Amount::from_be_bytes(&bytes), amount);
        }
    }
}
