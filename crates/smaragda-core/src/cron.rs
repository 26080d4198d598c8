//! Cron expression parsing and matching.
//!
//! Five whitespace-separated fields (`min hour day month dow`) with `*`,
//! ranges `a-b`, steps `*/n`, and comma lists, plus the `@hourly`, `@daily`,
//! `@weekly`, `@monthly` aliases. Matching is a plain set-membership check
//! on the UTC components of an instant.

use std::str::FromStr;

use snafu::Snafu;

use crate::Timestamp;

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[snafu(display("Cron expression {text:?} has {found} fields, expected 5"))]
    FieldCount { text: String, found: usize },
    #[snafu(display("Unknown cron alias {alias:?}"))]
    UnknownAlias { alias: String },
    #[snafu(display("Invalid cron {field} field {text:?}"))]
    InvalidField { field: &'static str, text: String },
    #[snafu(display(
        "Cron {field} value {value} out of range {min}..={max}"
    ))]
    ValueOutOfRange {
        field: &'static str,
        value: u32,
        min: u8,
        max: u8,
    },
    #[snafu(display("Cron {field} step must be positive in {text:?}"))]
    ZeroStep { field: &'static str, text: String },
}

/// One parsed field: the set of matching values as a bitmask.
///
/// The widest field (minutes) spans 0..=59, so a `u64` covers every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField(u64);

impl CronField {
    fn contains(self, value: u8) -> bool {
        self.0 & (1 << value) != 0
    }
}

struct FieldSpec {
    name: &'static str,
    min: u8,
    max: u8,
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23 };
const DAY: FieldSpec = FieldSpec { name: "day", min: 1, max: 31 };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12 };
const WEEKDAY: FieldSpec = FieldSpec { name: "weekday", min: 0, max: 6 };

fn parse_value(spec: &FieldSpec, text: &str) -> Result<u8, CronParseError> {
    let value: u32 = text.parse().map_err(|_| {
        InvalidFieldSnafu {
            field: spec.name,
            text,
        }
        .build()
    })?;
    if value < u32::from(spec.min) || u32::from(spec.max) < value {
        return ValueOutOfRangeSnafu {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        }
        .fail();
    }
    Ok(value as u8)
}

fn parse_field(spec: &FieldSpec, text: &str) -> Result<CronField, CronParseError> {
    let mut mask = 0u64;

    for part in text.split(',') {
        if part.is_empty() {
            return InvalidFieldSnafu {
                field: spec.name,
                text,
            }
            .fail();
        }

        if part == "*" {
            for v in spec.min..=spec.max {
                mask |= 1 << v;
            }
        } else if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step.parse().map_err(|_| {
                InvalidFieldSnafu {
                    field: spec.name,
                    text,
                }
                .build()
            })?;
            if step == 0 {
                return ZeroStepSnafu {
                    field: spec.name,
                    text,
                }
                .fail();
            }
            let mut v = u32::from(spec.min);
            while v <= u32::from(spec.max) {
                mask |= 1 << v;
                v += step;
            }
        } else if let Some((lo, hi)) = part.split_once('-') {
            let lo = parse_value(spec, lo)?;
            let hi = parse_value(spec, hi)?;
            if hi < lo {
                return InvalidFieldSnafu {
                    field: spec.name,
                    text,
                }
                .fail();
            }
            for v in lo..=hi {
                mask |= 1 << v;
            }
        } else {
            let v = parse_value(spec, part)?;
            mask |= 1 << v;
        }
    }

    Ok(CronField(mask))
}

/// A parsed cron expression with precomputed per-field value sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: CronField,
    hours: CronField,
    days: CronField,
    months: CronField,
    weekdays: CronField,
    text: String,
}

impl CronExpr {
    /// Whether the expression matches the UTC components of `ts`.
    pub fn matches(&self, ts: Timestamp) -> bool {
        self.minutes.contains(ts.utc_minute())
            && self.hours.contains(ts.utc_hour())
            && self.days.contains(ts.utc_day())
            && self.months.contains(ts.utc_month())
            && self.weekdays.contains(ts.utc_weekday())
    }

    fn expand_alias(alias: &str) -> Result<&'static str, CronParseError> {
        Ok(match alias {
            "@hourly" => "0 * * * *",
            "@daily" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            _ => return UnknownAliasSnafu { alias }.fail(),
        })
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let expanded = if text.starts_with('@') {
            Self::expand_alias(text)?
        } else {
            text
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let [minute, hour, day, month, weekday]: [&str; 5] =
            fields.as_slice().try_into().map_err(|_| {
                FieldCountSnafu {
                    text,
                    found: fields.len(),
                }
                .build()
            })?;

        Ok(Self {
            minutes: parse_field(&MINUTE, minute)?,
            hours: parse_field(&HOUR, hour)?,
            days: parse_field(&DAY, day)?,
            months: parse_field(&MONTH, month)?,
            weekdays: parse_field(&WEEKDAY, weekday)?,
            text: text.to_owned(),
        })
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(display("Invalid delay {text:?}, expected <number><s|m|h|d>"))]
pub struct DelayParseError {
    text: String,
}

/// Parse a delay string like `30s`, `5m`, `2h`, `1d` into milliseconds.
pub fn parse_delay(s: &str) -> Result<u64, DelayParseError> {
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let multiplier: u64 = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return DelayParseSnafu { text: s }.fail(),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return DelayParseSnafu { text: s }.fail();
    }
    let count: u64 = digits.parse().map_err(|_| DelayParseSnafu { text: s }.build())?;
    Ok(count * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y_m_d_h_min: (i32, u8, u8, u8, u8)) -> Timestamp {
        let (year, month, day, hour, minute) = y_m_d_h_min;
        let date = time::Date::from_calendar_date(
            year,
            time::Month::try_from(month).unwrap(),
            day,
        )
        .unwrap();
        let dt = date
            .with_hms(hour, minute, 0)
            .unwrap()
            .assume_utc();
        Timestamp::from_millis((dt.unix_timestamp_nanos() / 1_000_000) as u64)
    }

    #[test]
    fn wildcard_matches_everything() {
        let expr: CronExpr = "* * * * *".parse().unwrap();
        assert!(expr.matches(at((2024, 3, 1, 12, 30))));
        assert!(expr.matches(at((2025, 12, 31, 23, 59))));
    }

    #[test]
    fn daily_alias_matches_only_midnight() {
        let expr: CronExpr = "@daily".parse().unwrap();
        assert!(expr.matches(at((2024, 3, 1, 0, 0))));
        assert!(!expr.matches(at((2024, 3, 1, 0, 1))));
        assert!(!expr.matches(at((2024, 3, 1, 1, 0))));
    }

    #[test]
    fn weekly_alias_matches_sunday_midnight() {
        let expr: CronExpr = "@weekly".parse().unwrap();
        // 2024-03-03 was a Sunday
        assert!(expr.matches(at((2024, 3, 3, 0, 0))));
        assert!(!expr.matches(at((2024, 3, 4, 0, 0))));
    }

    #[test]
    fn steps_ranges_and_lists() {
        let expr: CronExpr = "*/15 9-17 * * 1,2,3".parse().unwrap();
        // 2024-03-04 was a Monday
        assert!(expr.matches(at((2024, 3, 4, 9, 0))));
        assert!(expr.matches(at((2024, 3, 4, 17, 45))));
        assert!(!expr.matches(at((2024, 3, 4, 9, 10))));
        assert!(!expr.matches(at((2024, 3, 4, 18, 0))));
        // 2024-03-03 was a Sunday
        assert!(!expr.matches(at((2024, 3, 3, 9, 0))));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!("* * * *".parse::<CronExpr>().is_err());
        assert!("60 * * * *".parse::<CronExpr>().is_err());
        assert!("* 24 * * *".parse::<CronExpr>().is_err());
        assert!("*/0 * * * *".parse::<CronExpr>().is_err());
        assert!("@yearly".parse::<CronExpr>().is_err());
        assert!("a * * * *".parse::<CronExpr>().is_err());
        assert!("5-2 * * * *".parse::<CronExpr>().is_err());
    }

    #[test]
    fn delay_strings() {
        assert_eq!(parse_delay("30s").unwrap(), 30_000);
        assert_eq!(parse_delay("5m").unwrap(), 300_000);
        assert_eq!(parse_delay("2h").unwrap(), 7_200_000);
        assert_eq!(parse_delay("1d").unwrap(), 86_400_000);
        assert!(parse_delay("abc").is_err());
        assert!(parse_delay("s").is_err());
        assert!(parse_delay("10").is_err());
        assert!(parse_delay("").is_err());
    }
}
