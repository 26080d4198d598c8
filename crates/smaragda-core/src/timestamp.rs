use core::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{ResultExt as _, Snafu};
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// Wall-clock instant, unix milliseconds UTC.
///
/// Displays and parses as ISO-8601 UTC (`YYYY-MM-DDTHH:MM:SS.sssZ`), which
/// is also its human-readable serde form; storage and binary serde use the
/// raw millisecond count.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(::bincode::Encode, ::bincode::Decode)]
pub struct Timestamp(u64);

const ISO_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

impl Timestamp {
    pub const ZERO: Self = Self(0);

    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Clock set before the unix epoch");
        Self(u64::try_from(elapsed.as_millis()).expect("Clock far beyond representable range"))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    fn datetime(self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(self.0 as i128 * 1_000_000)
            .expect("Millisecond timestamp in representable range")
    }

    pub fn utc_minute(self) -> u8 {
        self.datetime().minute()
    }

    pub fn utc_hour(self) -> u8 {
        self.datetime().hour()
    }

    /// Day of month, `1..=31`.
    pub fn utc_day(self) -> u8 {
        self.datetime().day()
    }

    /// Month, `1..=12`.
    pub fn utc_month(self) -> u8 {
        u8::from(self.datetime().month())
    }

    /// Day of week, `0..=6`, Sunday = 0 (cron convention).
    pub fn utc_weekday(self) -> u8 {
        self.datetime().weekday().number_days_from_sunday()
    }

    /// Whether two instants fall in the same UTC minute. Guards schedule
    /// firing: at most once per minute.
    pub fn same_utc_minute(self, other: Self) -> bool {
        self.0 / 60_000 == other.0 / 60_000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self.datetime().format(ISO_FORMAT).map_err(|_| fmt::Error)?;
        f.write_str(&formatted)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

#[derive(Debug, Snafu)]
pub enum TimestampParseError {
    #[snafu(display("Invalid ISO-8601 timestamp {text:?}"))]
    InvalidFormat {
        text: String,
        source: time::error::Parse,
    },
    #[snafu(display("Timestamp {text:?} is before the unix epoch"))]
    BeforeEpoch { text: String },
}

impl FromStr for Timestamp {
    type Err = TimestampParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = OffsetDateTime::parse(s, &Rfc3339).context(InvalidFormatSnafu { text: s })?;
        let nanos = dt.unix_timestamp_nanos();
        if nanos < 0 {
            return BeforeEpochSnafu { text: s }.fail();
        }
        Ok(Self((nanos / 1_000_000) as u64))
    }
}

impl ::serde::Serialize for Timestamp {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: ::serde::Serializer,
    {
        if s.is_human_readable() {
            s.serialize_str(&self.to_string())
        } else {
            s.serialize_u64(self.0)
        }
    }
}

impl<'de> ::serde::de::Deserialize<'de> for Timestamp {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: ::serde::Deserializer<'de>,
    {
        if d.is_human_readable() {
            let str = <String>::deserialize(d)?;
            str.parse()
                .map_err(|e| ::serde::de::Error::custom(format!("Deserialization error: {e:#}")))
        } else {
            Ok(Self(<u64>::deserialize(d)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_iso_8601_utc() {
        // 2024-03-01T12:30:45.123Z
        let ts = Timestamp::from_millis(1_709_296_245_123);
        assert_eq!(ts.to_string(), "2024-03-01T12:30:45.123Z");
    }

    #[test]
    fn parses_own_output() {
        let ts = Timestamp::from_millis(1_709_296_245_123);
        let parsed: Timestamp = ts.to_string().parse().expect("Valid timestamp");
        assert_eq!(ts, parsed);
    }

    #[test]
    fn utc_components() {
        let ts = Timestamp::from_millis(1_709_296_245_123);
        assert_eq!(ts.utc_minute(), 30);
        assert_eq!(ts.utc_hour(), 12);
        assert_eq!(ts.utc_day(), 1);
        assert_eq!(ts.utc_month(), 3);
        // 2024-03-01 was a Friday
        assert_eq!(ts.utc_weekday(), 5);
    }

    #[test]
    fn same_utc_minute_boundaries() {
        let a = Timestamp::from_millis(120_000);
        let b = Timestamp::from_millis(179_999);
        let c = Timestamp::from_millis(180_000);
        assert!(a.same_utc_minute(b));
        assert!(!a.same_utc_minute(c));
    }
}
