//! Identifier types for Bridge-Me-Not protocol entities.

use alloy_primitives::{hex, B256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a swap.
/// Equals the hashlock (or order hash) the swap was committed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwapId(B256);

impl SwapId {
    /// Create a swap ID from a 32-byte commitment.
    pub fn new(id: B256) -> Self {
        Self(id)
    }

    /// Parse from a `0x`-prefixed hex string.
    pub fn parse(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(s.parse()?))
    }

    /// Get the underlying bytes.
    pub fn as_b256(&self) -> &B256 {
        &self.0
    }

    /// Name of the distributed lock guarding this swap.
    pub fn lock_resource(&self) -> String {
        format!("swap:{}", self.0)
    }
}

impl From<B256> for SwapId {
    fn from(id: B256) -> Self {
        Self(id)
    }
}

impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one resolver process instance.
///
/// Lock ownership is checked against this value, so two instances must never
/// share one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    /// Create a holder ID from a configured name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered instance identity.
    pub fn generate() -> Self {
        Self(format!("resolver-{}", Uuid::now_v7()))
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HolderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// EVM chain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_id_parse() {
        let s = "0x1111111111111111111111111111111111111111111111111111111111111111";
        let id = SwapId::parse(s).unwrap();
        assert_eq!(id.to_string(), s);
        assert_eq!(id.lock_resource(), format!("swap:{}", s));
    }

    #[test]
    fn test_swap_id_parse_rejects_short_input() {
        assert!(SwapId::parse("0x1234").is_err());
    }

    #[test]
    fn test_holder_ids_are_unique() {
        let a = HolderId::generate();
        let b = HolderId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("resolver-"));
    }
}
