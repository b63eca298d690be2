use std::fmt::{Display, Formatter};
use std::str::FromStr;

use time::Duration;

use crate::ValidationError;

/// A human readable shift such as `1 week ago` or `3 hours`, added to every
/// value of the time column.
///
/// `ago` makes the duration negative: `1 week ago` is `-7 days`, so a series
/// fetched with it is labeled one week earlier than the rows it came from.
/// Without `ago` the shift moves labels forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeShift(Duration);

impl TimeShift {
    pub const fn duration(self) -> Duration {
        self.0
    }
}

impl Display for TimeShift {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.0.whole_seconds())
    }
}

impl FromStr for TimeShift {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidTimeShift {
            value: value.to_owned(),
        };

        let normalized = value.trim().to_ascii_lowercase();
        let mut parts = normalized.split_whitespace().collect::<Vec<_>>();
        let past = parts.last() == Some(&"ago");
        if past {
            parts.pop();
        }

        let [amount, unit] = parts.as_slice() else {
            return Err(invalid());
        };
        let amount = amount.parse::<i64>().map_err(|_| invalid())?;
        let unit = unit.strip_suffix('s').unwrap_or(unit);
        let seconds_per_unit = match unit {
            "second" | "sec" => 1,
            "minute" | "min" => 60,
            "hour" => 3_600,
            "day" => 86_400,
            "week" => 7 * 86_400,
            "month" => 30 * 86_400,
            "quarter" => 91 * 86_400,
            "year" => 365 * 86_400,
            _ => return Err(invalid()),
        };

        let seconds = amount.checked_mul(seconds_per_unit).ok_or_else(invalid)?;
        let signed = if past { -seconds } else { seconds };
        Ok(Self(Duration::seconds(signed)))
    }
}
