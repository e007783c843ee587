//! Minute-resolution UTC timestamps
//!
//! Everything in the collector is keyed by the wall-clock minute: store row
//! keys, snapshot paths, history entries, and the checkpoint cursor. `Minute`
//! keeps that arithmetic in one place so the rest of the engine never touches
//! sub-minute precision.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A UTC timestamp truncated to the minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Minute(DateTime<Utc>);

/// Calendar parts `(year, month, day, hour, minute)`, serialized as a
/// five-element JSON array. This is the timestamp shape the dashboard expects.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MinuteParts(pub i32, pub u32, pub u32, pub u32, pub u32);

impl Minute {
    /// Truncate an arbitrary timestamp down to its minute.
    pub fn truncate(dt: DateTime<Utc>) -> Self {
        let dt = dt
            - Duration::seconds(dt.second() as i64)
            - Duration::nanoseconds(dt.nanosecond() as i64);
        Self(dt)
    }

    /// The minute the collector should read next: one minute in the past, so
    /// the store has had a full minute to accumulate data before we ask.
    pub fn collection_now() -> Self {
        Self::truncate(Utc::now() - Duration::minutes(1))
    }

    /// Start of this minute as a full timestamp.
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn succ(&self) -> Self {
        Self(self.0 + Duration::minutes(1))
    }

    pub fn pred(&self) -> Self {
        Self(self.0 - Duration::minutes(1))
    }

    /// Whole minutes from `earlier` up to `self` (negative if `self` is older).
    pub fn minutes_since(&self, earlier: Minute) -> i64 {
        (self.0 - earlier.0).num_minutes()
    }

    /// Store row key for this minute: `<tag>::<version>:<ISO-minute>`,
    /// e.g. `firefox::4.0:2011-03-22T14:05:00.000`.
    pub fn row_key(&self, tag: &str, version: &str) -> String {
        format!("{}::{}:{}", tag, version, self.0.format("%Y-%m-%dT%H:%M:00.000"))
    }

    /// Relative snapshot path for one data kind: `Y/m/d/H/M/<kind>.json`.
    pub fn snapshot_path(&self, kind: &str) -> String {
        format!("{}/{}.json", self.dir(), kind)
    }

    /// Relative snapshot directory for this minute: `Y/m/d/H/M`.
    pub fn dir(&self) -> String {
        self.0.format("%Y/%m/%d/%H/%M").to_string()
    }

    /// Relative day directory: `Y/m/d`. The retention sweep works at this level.
    pub fn day_dir(&self) -> String {
        self.0.format("%Y/%m/%d").to_string()
    }

    pub fn parts(&self) -> MinuteParts {
        MinuteParts(
            self.0.year(),
            self.0.month(),
            self.0.day(),
            self.0.hour(),
            self.0.minute(),
        )
    }
}

impl std::fmt::Display for Minute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M"))
    }
}

// Checkpoints carry minutes through bincode, so serialize as a bare epoch
// second count rather than chrono's RFC 3339 string.
impl Serialize for Minute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0.timestamp())
    }
}

impl<'de> Deserialize<'de> for Minute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        let dt = DateTime::<Utc>::from_timestamp(secs - secs.rem_euclid(60), 0)
            .ok_or_else(|| D::Error::custom("minute timestamp out of range"))?;
        Ok(Minute(dt))
    }
}
