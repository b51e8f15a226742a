//! Value types shared between the lifecycle core and its storage collaborators.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const SECS_PER_DAY: i64 = 86_400;

/// The partitioning dimension: seconds since the Unix epoch, UTC.
///
/// Keys are totally ordered. Monotonic integer dimensions can use the raw
/// value directly through [`PartitionKey::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub i64);

impl PartitionKey {
    /// Creates a key from a raw value.
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Creates a key at midnight UTC of the given calendar date.
    ///
    /// Returns `None` for dates that do not exist.
    #[must_use]
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(Self(midnight.and_utc().timestamp()))
    }

    /// Creates a key from a UTC timestamp.
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self(at.timestamp())
    }

    /// Returns the key as a UTC timestamp, if representable.
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0, 0)
    }

    /// Parses `YYYY-MM-DD`, RFC 3339, or a raw integer.
    pub fn parse(input: &str) -> Result<Self, ParseKeyError> {
        let trimmed = input.trim();
        if let Ok(raw) = trimmed.parse::<i64>() {
            return Ok(Self(raw));
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(Self(midnight.and_utc().timestamp()));
            }
        }
        if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(Self(at.timestamp()));
        }
        Err(ParseKeyError {
            input: input.to_string(),
        })
    }

    /// Adds `n` periods, returning `None` on overflow.
    #[must_use]
    pub fn checked_add_periods(self, period: Duration, n: u32) -> Option<Self> {
        let secs = i64::try_from(period.as_secs()).ok()?;
        let delta = secs.checked_mul(i64::from(n))?;
        self.0.checked_add(delta).map(Self)
    }

    /// Subtracts `n` periods, returning `None` on overflow.
    #[must_use]
    pub fn checked_sub_periods(self, period: Duration, n: u32) -> Option<Self> {
        let secs = i64::try_from(period.as_secs()).ok()?;
        let delta = secs.checked_mul(i64::from(n))?;
        self.0.checked_sub(delta).map(Self)
    }

    /// Rounds down to a multiple of `period` (floor, also for negative keys).
    ///
    /// A zero-length period leaves the key unchanged.
    #[must_use]
    pub fn align_down(self, period: Duration) -> Self {
        match i64::try_from(period.as_secs()) {
            Ok(secs) if secs > 0 => Self(self.0.div_euclid(secs) * secs),
            _ => self,
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(at) if self.0.rem_euclid(SECS_PER_DAY) == 0 => {
                write!(f, "{}", at.format("%Y-%m-%d"))
            }
            Some(at) => write!(f, "{}", at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for PartitionKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Returned when a string is not a recognizable partition key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid partition key: {input:?} (expected YYYY-MM-DD, RFC 3339, or an integer)")]
pub struct ParseKeyError {
    /// The rejected input.
    pub input: String,
}

/// A half-open key range `[lower, upper)`. `None` bounds are infinite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound, or negative infinity.
    pub lower: Option<PartitionKey>,
    /// Exclusive upper bound, or positive infinity.
    pub upper: Option<PartitionKey>,
}

impl KeyRange {
    /// The range covering every key.
    pub const UNBOUNDED: Self = Self {
        lower: None,
        upper: None,
    };

    /// Creates a range from its bounds.
    #[must_use]
    pub const fn new(lower: Option<PartitionKey>, upper: Option<PartitionKey>) -> Self {
        Self { lower, upper }
    }

    /// Returns true if `key` falls inside the range.
    #[must_use]
    pub fn contains(&self, key: PartitionKey) -> bool {
        self.lower.map_or(true, |lower| key >= lower) && self.upper.map_or(true, |upper| key < upper)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            Some(lower) => write!(f, "[{lower}, ")?,
            None => write!(f, "[-inf, ")?,
        }
        match self.upper {
            Some(upper) => write!(f, "{upper})"),
            None => write!(f, "+inf)"),
        }
    }
}

/// Stable identity of a partition. Assigned by the catalog, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u64);

impl PartitionId {
    /// Creates a partition ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p:{}", self.0)
    }
}

/// Identifies a storage class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TierId(pub u32);

impl TierId {
    /// Creates a tier ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier:{}", self.0)
    }
}

/// Physical compression applied to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CompressionMode {
    /// Uncompressed; optimized for write throughput.
    #[default]
    None,
    /// Row compression; balanced.
    Row,
    /// Page compression; maximum density.
    Page,
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Row => "row",
            Self::Page => "page",
        };
        f.write_str(name)
    }
}

/// A single row as seen by the storage engine: its partition key and an
/// opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row {
    /// The partitioning key value.
    pub key: PartitionKey,
    /// Opaque row bytes.
    pub payload: Vec<u8>,
}

impl Row {
    /// Creates a row.
    #[must_use]
    pub fn new(key: PartitionKey, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    /// Approximate on-disk size of the row.
    #[must_use]
    pub fn encoded_size(&self) -> u64 {
        8 + self.payload.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_from_ymd_and_display() {
        let key = PartitionKey::from_ymd(2023, 2, 1).unwrap();
        assert_eq!(key.to_string(), "2023-02-01");
        assert_eq!(key.as_i64(), 1_675_209_600);
    }

    #[test]
    fn key_parse_formats() {
        let date = PartitionKey::parse("2022-03-01").unwrap();
        assert_eq!(date, PartitionKey::from_ymd(2022, 3, 1).unwrap());

        let rfc = PartitionKey::parse("2022-03-01T12:00:00Z").unwrap();
        assert_eq!(rfc.as_i64(), date.as_i64() + 12 * 3600);
        assert_eq!(rfc.to_string(), "2022-03-01T12:00:00Z");

        assert_eq!(PartitionKey::parse("42").unwrap(), PartitionKey::new(42));
        assert!(PartitionKey::parse("yesterday").is_err());
    }

    #[test]
    fn key_align_down_floors_negative_values() {
        let day = Duration::from_secs(86_400);
        assert_eq!(PartitionKey::new(86_401).align_down(day), PartitionKey::new(86_400));
        assert_eq!(PartitionKey::new(-1).align_down(day), PartitionKey::new(-86_400));
        assert_eq!(PartitionKey::new(7).align_down(Duration::ZERO), PartitionKey::new(7));
    }

    #[test]
    fn key_period_arithmetic_detects_overflow() {
        let day = Duration::from_secs(86_400);
        let base = PartitionKey::new(0);
        assert_eq!(base.checked_add_periods(day, 2), Some(PartitionKey::new(172_800)));
        assert_eq!(base.checked_sub_periods(day, 1), Some(PartitionKey::new(-86_400)));
        assert_eq!(PartitionKey::new(i64::MAX).checked_add_periods(day, 1), None);
    }

    #[test]
    fn range_contains_is_half_open() {
        let range = KeyRange::new(Some(PartitionKey::new(10)), Some(PartitionKey::new(20)));
        assert!(!range.contains(PartitionKey::new(9)));
        assert!(range.contains(PartitionKey::new(10)));
        assert!(range.contains(PartitionKey::new(19)));
        assert!(!range.contains(PartitionKey::new(20)));
        assert!(KeyRange::UNBOUNDED.contains(PartitionKey::new(i64::MIN)));
    }

    #[test]
    fn range_display() {
        let range = KeyRange::new(None, PartitionKey::from_ymd(2022, 1, 1));
        assert_eq!(range.to_string(), "[-inf, 2022-01-01)");
    }

    #[test]
    fn compression_mode_default_is_none() {
        assert_eq!(CompressionMode::default(), CompressionMode::None);
        assert_eq!(CompressionMode::Page.to_string(), "page");
    }

    proptest::proptest! {
        #[test]
        fn align_down_lands_on_period_at_or_below(raw in -1_000_000_000_000i64..1_000_000_000_000, secs in 1u64..10_000_000) {
            let period = Duration::from_secs(secs);
            let aligned = PartitionKey::new(raw).align_down(period);
            proptest::prop_assert!(aligned.as_i64() <= raw);
            proptest::prop_assert!(raw - aligned.as_i64() < secs as i64);
            proptest::prop_assert_eq!(aligned.as_i64().rem_euclid(secs as i64), 0);
        }
    }
}
