//! Record identifiers
//!
//! An `Identifier` is 12 bytes: a 4-byte big-endian seconds timestamp
//! followed by an 8-byte big-endian counter. Big-endian layout makes byte
//! order, hex-string order and `(timestamp, counter)` order all agree, so a
//! time range is just a key range.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{LogKvError, LogKvResult};

/// Identifier length in bytes
pub const ID_SIZE: usize = 12;

/// Identifier length as hex characters
pub const ID_HEX_LEN: usize = ID_SIZE * 2;

/// Time-ordered, lexicographically sortable record key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Identifier([u8; ID_SIZE]);

impl Identifier {
    /// Smallest possible identifier (timestamp 0, counter 0).
    pub const MIN: Identifier = Identifier([0; ID_SIZE]);

    /// Largest possible identifier.
    pub const MAX: Identifier = Identifier([0xFF; ID_SIZE]);

    /// Identifier stamped with the current wall-clock second.
    pub fn new(counter: u64) -> Self {
        Self::from_parts(unix_now(), counter)
    }

    /// Identifier from an explicit timestamp and counter.
    pub fn from_parts(timestamp: u32, counter: u64) -> Self {
        let mut buf = [0u8; ID_SIZE];
        buf[0..4].copy_from_slice(&timestamp.to_be_bytes());
        buf[4..12].copy_from_slice(&counter.to_be_bytes());
        Identifier(buf)
    }

    /// First identifier at second `ts`; the inclusive lower bound for
    /// "everything at or after `ts`".
    pub fn lower_bound(ts: u32) -> Self {
        Self::from_parts(ts, 0)
    }

    /// Parse from exactly 12 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> LogKvResult<Self> {
        let arr: [u8; ID_SIZE] = bytes.try_into().map_err(|_| LogKvError::InvalidIdentifier {
            reason: format!("expected {} bytes, got {}", ID_SIZE, bytes.len()),
        })?;
        Ok(Identifier(arr))
    }

    /// Parse from a 24-character hex string.
    pub fn from_hex(s: &str) -> LogKvResult<Self> {
        if s.len() != ID_HEX_LEN {
            return Err(LogKvError::InvalidIdentifier {
                reason: format!("expected {} hex chars, got {}", ID_HEX_LEN, s.len()),
            });
        }
        let bytes = hex::decode(s).map_err(|e| LogKvError::InvalidIdentifier {
            reason: e.to_string(),
        })?;
        Self::from_bytes(&bytes)
    }

    /// Sortable lowercase hex form.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    /// Seconds component.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Counter component.
    pub fn counter(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(buf)
    }
}

/// Hex prefix for records at or after `ts`. Any identifier whose hex form
/// compares `>=` this prefix has `timestamp() >= ts`.
pub fn timestamp_hex(ts: u32) -> String {
    hex::encode(ts.to_be_bytes())
}

/// Current wall-clock time in whole seconds.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({}:{})", self.timestamp(), self.counter())
    }
}

impl std::str::FromStr for Identifier {
    type Err = LogKvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
