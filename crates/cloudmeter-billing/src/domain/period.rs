use crate::error::{BillingError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Half-open reporting window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(BillingError::validation(
                "period_start",
                "period_start must be less than period_end",
            ));
        }
        Ok(Self { start, end })
    }

    /// Expand a `YYYY`, `YYYY-MM` or `YYYY-MM-DD` token into a year, month or
    /// day window.
    pub fn parse_token(token: &str) -> Result<Self> {
        let invalid = || {
            BillingError::validation("time_period", format!("invalid time_period `{}`", token))
        };

        let parts: Vec<&str> = token.splitn(3, '-').collect();
        let mut numbers = [1u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part.trim().parse().map_err(|_| invalid())?;
        }
        let [year, month, day] = numbers;
        let year = i32::try_from(year).map_err(|_| invalid())?;

        let start = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(invalid)?;
        let end = match parts.len() {
            1 => NaiveDate::from_ymd_opt(year + 1, 1, 1),
            2 => first_of_next_month(start),
            _ => start.succ_opt(),
        }
        .ok_or_else(invalid)?;

        Self::new(midnight(start), midnight(end))
    }

    /// Calendar month containing `now`.
    pub fn month_of(now: DateTime<Utc>) -> Self {
        let start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
            .unwrap_or_else(|| now.date_naive());
        let end = first_of_next_month(start).unwrap_or_else(|| start + Duration::days(31));
        Self {
            start: midnight(start),
            end: midnight(end),
        }
    }

    pub fn current_month() -> Self {
        Self::month_of(Utc::now())
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Parse an ISO 8601 timestamp. A trailing `Z` is optional and naive values
/// are taken as UTC; explicit offsets are honoured.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    let naive = value.strip_suffix('Z').unwrap_or(value);
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|dt| Utc.from_utc_datetime(&dt))
}
