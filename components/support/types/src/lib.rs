/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Typesafe way to manage sync storage timestamps without accidentally
/// mixing them up with other integer-shaped values.
///
/// The unit is hundredths of a second since the unix epoch, which is the
/// resolution the wire format is defined at. The externally rendered form
/// (headers, JSON) is decimal seconds with exactly two fractional digits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Hundredths of a second since the epoch.
    #[inline]
    pub fn as_centis(self) -> u64 {
        self.0
    }

    /// The timestamp one tick (1/100 s) later.
    #[inline]
    pub fn next(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }

    /// Offset by a whole number of seconds, as used for TTL expiry.
    #[inline]
    pub fn add_seconds(self, secs: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(secs.saturating_mul(100)))
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(d.as_secs() * 100 + u64::from(d.subsec_millis()) / 10)
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(centis: u64) -> Self {
        Timestamp(centis)
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Error returned when parsing a wire timestamp fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimestampError;

impl fmt::Display for ParseTimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid timestamp")
    }
}

impl std::error::Error for ParseTimestampError {}

impl FromStr for Timestamp {
    type Err = ParseTimestampError;

    /// Parses `1234`, `1234.5` or `1234.56`. Anything else (signs, more
    /// fractional digits, stray characters) is rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, ""),
        };
        if secs.is_empty() || frac.len() > 2 {
            return Err(ParseTimestampError);
        }
        if !secs.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseTimestampError);
        }
        let secs: u64 = secs.parse().map_err(|_| ParseTimestampError)?;
        let centis = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| ParseTimestampError)? * 10,
            _ => frac.parse::<u64>().map_err(|_| ParseTimestampError)?,
        };
        secs.checked_mul(100)
            .and_then(|c| c.checked_add(centis))
            .map(Timestamp)
            .ok_or(ParseTimestampError)
    }
}

// JSON carries timestamps as decimal seconds (`"modified": 1413405.64`), so
// serde goes through f64 rather than the integer tick count.
impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0 as f64 / 100.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(de::Error::custom("timestamp out of range"));
        }
        Ok(Timestamp((secs * 100.0).round() as u64))
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64)) // hrm - no u64 in rusqlite
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(|v| Timestamp(v.max(0) as u64))
    }
}
