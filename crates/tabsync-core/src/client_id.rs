//! ClientId: stable per-process identifier the embedded database stamps on
//! every local write.
//!
//! The change router compares a change's `source` against this id to drop
//! self-originated changes. Displays as a 16-character hex string.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientIdError {
    #[error("Invalid client ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identifier of one browser context (tab, window or worker).
///
/// # Examples
/// ```
/// use tabsync_core::ClientId;
///
/// let parsed: ClientId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Generate a new random client ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// True when `source` (as recorded on a change) names this client.
    pub fn is_source_of(&self, source: Option<&str>) -> bool {
        source.is_some_and(|s| s.eq_ignore_ascii_case(&self.to_string()))
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)?;
            return Ok(Self(id));
        }
        Err(ClientIdError::InvalidFormat)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// Serialize as hex string so it matches the `source` field on change records.
impl serde::Serialize for ClientId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ClientId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
