//! Security-level lattice.
//!
//! Levels are totally ordered `Invalid < Valid < Trusted`. Combining partial results
//! always takes the minimum, so a chain of checks can only lower the outcome.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of verifying a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    /// Cryptographic check failed, or the signer could not be evaluated
    #[default]
    Invalid,
    /// Signature is cryptographically correct
    Valid,
    /// Correct and anchored in a trusted root
    Trusted,
}

impl SecurityLevel {
    /// Lattice meet: the weaker of the two levels.
    pub fn meet(self, other: SecurityLevel) -> SecurityLevel {
        self.min(other)
    }

    /// Meet over any number of levels. No levels at all is `Invalid`.
    pub fn aggregate<I>(levels: I) -> SecurityLevel
    where
        I: IntoIterator<Item = SecurityLevel>,
    {
        let mut iter = levels.into_iter();
        match iter.next() {
            Some(first) => iter.fold(first, SecurityLevel::meet),
            None => SecurityLevel::Invalid,
        }
    }

    /// Whether this level satisfies `required`.
    pub fn satisfies(self, required: SecurityLevel) -> bool {
        self >= required
    }

    /// Upper-case name used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::Invalid => "INVALID",
            SecurityLevel::Valid => "VALID",
            SecurityLevel::Trusted => "TRUSTED",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityLevel {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INVALID" => Ok(SecurityLevel::Invalid),
            "VALID" => Ok(SecurityLevel::Valid),
            "TRUSTED" => Ok(SecurityLevel::Trusted),
            other => Err(crate::error::Error::InvalidArgument(format!(
                "unknown security level: {}",
                other
            ))),
        }
    }
}
