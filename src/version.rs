//! Monotonic version tokens encoded as unbounded decimal strings.
//!
//! Events and shared aggregates stamp every publish, command, and state
//! snapshot with a version. Long-lived realms can outgrow any fixed-width
//! integer, so versions are decimal strings that increment with carry
//! propagation once the `u64` fast path overflows.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseVersionError;

/// Return the successor of a non-negative decimal integer string.
///
/// Leading zeros are accepted and dropped from the result.
///
/// # Errors
///
/// Returns [`ParseVersionError`] if `value` is empty or contains anything
/// other than ASCII digits.
///
/// # Examples
///
/// ```
/// use aggsync::increment;
///
/// assert_eq!(increment("41").unwrap(), "42");
/// assert_eq!(increment("18446744073709551615").unwrap(), "18446744073709551616");
/// ```
pub fn increment(value: &str) -> Result<String, ParseVersionError> {
    let digits = normalize(value)?;
    Ok(successor(digits))
}

/// Strip leading zeros after validating that `value` is all digits.
fn normalize(value: &str) -> Result<&str, ParseVersionError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseVersionError(value.to_owned()));
    }
    let trimmed = value.trim_start_matches('0');
    Ok(if trimmed.is_empty() { "0" } else { trimmed })
}

/// Successor of an already normalized digit string.
fn successor(digits: &str) -> String {
    if let Ok(n) = digits.parse::<u64>()
        && let Some(next) = n.checked_add(1)
    {
        return next.to_string();
    }

    // Digit-wise addition, least significant digit first.
    let mut out: Vec<u8> = Vec::with_capacity(digits.len() + 1);
    let mut carry = 1u8;
    for b in digits.bytes().rev() {
        let sum = (b - b'0') + carry;
        out.push(b'0' + sum % 10);
        carry = sum / 10;
    }
    if carry > 0 {
        out.push(b'0' + carry);
    }
    out.iter().rev().map(|&b| char::from(b)).collect()
}

/// A monotonically increasing version token.
///
/// Ordered by numeric value, serialized as its decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(String);

impl Version {
    /// The successor of this version.
    pub fn next(&self) -> Version {
        Version(successor(&self.0))
    }

    /// Advance this version in place and return the new value.
    pub fn bump(&mut self) -> Version {
        self.0 = successor(&self.0);
        self.clone()
    }

    /// The decimal digits of this version.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Version {
    fn default() -> Self {
        Version("0".to_owned())
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize(s).map(|digits| Version(digits.to_owned()))
    }
}

impl TryFrom<String> for Version {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Version(value.to_string())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Normalized digit strings: longer means larger.
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_small_values() {
        assert_eq!(increment("0").unwrap(), "1");
        assert_eq!(increment("9").unwrap(), "10");
        assert_eq!(increment("199").unwrap(), "200");
    }

    #[test]
    fn crosses_the_exact_integer_boundary() {
        let mut v = increment("9007199254740991").unwrap();
        assert_eq!(v, "9007199254740992");
        for _ in 0..4 {
            v = increment(&v).unwrap();
        }
        assert_eq!(v, "9007199254740996");
    }

    #[test]
    fn carries_past_u64_max() {
        assert_eq!(
            increment(&u64::MAX.to_string()).unwrap(),
            "18446744073709551616"
        );
        assert_eq!(
            increment("99999999999999999999999999").unwrap(),
            "100000000000000000000000000"
        );
    }

    #[test]
    fn n_increments_from_zero_yield_n() {
        let mut v = String::from("0");
        for _ in 0..1234 {
            v = increment(&v).unwrap();
        }
        assert_eq!(v, "1234");
    }

    #[test]
    fn strips_leading_zeros() {
        assert_eq!(increment("0007").unwrap(), "8");
        assert_eq!(increment("000").unwrap(), "1");
    }

    #[test]
    fn rejects_non_digits() {
        assert!(increment("").is_err());
        assert!(increment("-1").is_err());
        assert!(increment("12a").is_err());
        assert!(increment(" 1").is_err());
    }

    #[test]
    fn version_orders_numerically() {
        let small: Version = "99".parse().unwrap();
        let large: Version = "100".parse().unwrap();
        assert!(small < large);
        assert!(small.next() == large);

        let huge: Version = "18446744073709551616".parse().unwrap();
        assert!(Version::from(u64::MAX) < huge);
    }

    #[test]
    fn bump_returns_new_value() {
        let mut v = Version::default();
        assert_eq!(v.bump().as_str(), "1");
        assert_eq!(v.bump().as_str(), "2");
        assert_eq!(v.to_string(), "2");
    }

    #[test]
    fn serializes_as_string() {
        let v: Version = "123456789012345678901234567890".parse().unwrap();
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"123456789012345678901234567890\"");
        let back: Version = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
        assert!(serde_json::from_str::<Version>("\"x1\"").is_err());
    }
}
