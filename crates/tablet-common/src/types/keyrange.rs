//! Shard key ranges.
//!
//! A shard owns a contiguous range of the 64-bit keyspace id space. Shard
//! names follow the `<start>-<end>` hex convention, where either side may
//! be empty to mean unbounded: `-80`, `40-80`, `80-`. A name without a
//! dash (for example `0`) or a lone `-` names the whole keyspace.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{TabletError, TabletResult};

/// Half-open key range `[start, end)`. `None` on either side is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: Option<u64>,
    /// Exclusive upper bound.
    pub end: Option<u64>,
}

impl KeyRange {
    /// The range covering every key.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Creates a range from explicit bounds.
    #[must_use]
    pub const fn new(start: Option<u64>, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Parses a shard name into its key range.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either side is not valid hex, is longer
    /// than 16 digits, or the range is empty.
    pub fn parse_shard(shard: &str) -> TabletResult<Self> {
        let Some((start, end)) = shard.split_once('-') else {
            return Ok(Self::full());
        };
        let range = Self {
            start: parse_bound(shard, start)?,
            end: parse_bound(shard, end)?,
        };
        if let (Some(s), Some(e)) = (range.start, range.end) {
            if s >= e {
                return Err(TabletError::invalid_argument(format!(
                    "shard {shard} has an empty key range"
                )));
            }
        }
        Ok(range)
    }

    /// Returns true if the range covers every key.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Returns true if `key` falls inside the range.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.start.map_or(true, |s| key >= s) && self.end.map_or(true, |e| key < e)
    }

    /// Lowest key in the range.
    #[must_use]
    pub fn lower(&self) -> u64 {
        self.start.unwrap_or(0)
    }

    /// Clamps `key` into the range. An unbounded end clamps to `u64::MAX`.
    #[must_use]
    pub fn clamp(&self, key: u64) -> u64 {
        let key = key.max(self.lower());
        match self.end {
            Some(e) => key.min(e),
            None => key,
        }
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.start {
            write!(f, "{s:016x}")?;
        }
        f.write_str("-")?;
        if let Some(e) = self.end {
            write!(f, "{e:016x}")?;
        }
        Ok(())
    }
}

/// Parses one side of a shard name. Hex digits are left-aligned in the
/// 64-bit key space, so `80` is `0x8000_0000_0000_0000`.
fn parse_bound(shard: &str, side: &str) -> TabletResult<Option<u64>> {
    if side.is_empty() {
        return Ok(None);
    }
    if side.len() > 16 {
        return Err(TabletError::invalid_argument(format!(
            "shard {shard} bound {side} exceeds 64 bits"
        )));
    }
    let raw = u64::from_str_radix(side, 16).map_err(|_| {
        TabletError::invalid_argument(format!("shard {shard} bound {side} is not hex"))
    })?;
    // len is 1..=16, so the shift stays below 64.
    let shift = 64 - 4 * side.len();
    Ok(Some(raw << shift))
}
