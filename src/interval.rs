//! Weekly embargo windows.
//!
//! An embargo is a union of weekly intervals during which the bot must not
//! merge. Intervals are given in a human form like
//! `"Friday 18:00 - Monday 09:00"` (weekday names or 3-letter prefixes,
//! 24-hour times, optional trailing `UTC` token) and may be comma-separated.

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};

use crate::error::BotError;

/// One weekly interval, possibly wrapping around the end of the week.
///
/// The stored invariant is `from_weekday <= to_weekday`; a wrap-around
/// interval (e.g. Fri-Mon) is stored as its complement (Mon-Fri) with the
/// `is_complement` flag set, and the coverage test inverted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyInterval {
    from_weekday: Weekday,
    from_time: NaiveTime,
    to_weekday: Weekday,
    to_time: NaiveTime,
    is_complement: bool,
}

impl WeeklyInterval {
    pub fn new(
        from_weekday: Weekday,
        from_time: NaiveTime,
        to_weekday: Weekday,
        to_time: NaiveTime,
    ) -> Self {
        let is_complement =
            from_weekday.num_days_from_monday() > to_weekday.num_days_from_monday();
        if is_complement {
            Self {
                from_weekday: to_weekday,
                from_time: to_time,
                to_weekday: from_weekday,
                to_time: from_time,
                is_complement,
            }
        } else {
            Self {
                from_weekday,
                from_time,
                to_weekday,
                to_time,
                is_complement,
            }
        }
    }

    /// Parse one interval from its human form, e.g. `"Fri 18:00 - Mon 09:00"`.
    pub fn from_human(spec: &str) -> Result<Self, BotError> {
        let (from_part, to_part) = spec.split_once('-').ok_or_else(|| {
            BotError::config(format!("embargo interval needs a '-' separator: {:?}", spec))
        })?;

        let (from_weekday, from_time) = parse_endpoint(from_part)?;
        let (to_weekday, to_time) = parse_endpoint(to_part)?;
        Ok(Self::new(from_weekday, from_time, to_weekday, to_time))
    }

    /// Whether `date` falls inside this interval.
    pub fn covers(&self, date: DateTime<Utc>) -> bool {
        self.interval_covers(date) != self.is_complement
    }

    fn interval_covers(&self, date: DateTime<Utc>) -> bool {
        let weekday = date.weekday().num_days_from_monday();
        let time = date.time();
        // The complement interval excludes its own endpoints, so the original
        // interval keeps them.
        let before = |a: NaiveTime, b: NaiveTime| {
            if self.is_complement {
                a <= b
            } else {
                a < b
            }
        };

        let from = self.from_weekday.num_days_from_monday();
        let to = self.to_weekday.num_days_from_monday();

        if !(from <= weekday && weekday <= to) {
            return false;
        }
        if from == weekday && before(time, self.from_time) {
            return false;
        }
        if to == weekday && before(self.to_time, time) {
            return false;
        }
        true
    }
}

fn parse_endpoint(part: &str) -> Result<(Weekday, NaiveTime), BotError> {
    let cleaned = part.replace('@', " ");
    let mut words = cleaned.split_whitespace();

    let day_word = words
        .next()
        .ok_or_else(|| BotError::config(format!("missing weekday in embargo part {:?}", part)))?;
    let time_word = words
        .next()
        .ok_or_else(|| BotError::config(format!("missing time in embargo part {:?}", part)))?;

    if let Some(zone) = words.next() {
        if !zone.eq_ignore_ascii_case("utc") {
            return Err(BotError::config(format!(
                "embargo times must be UTC, got timezone {:?}",
                zone
            )));
        }
    }

    let weekday: Weekday = day_word
        .parse()
        .map_err(|_| BotError::config(format!("not a week day: {:?}", day_word)))?;
    let time = NaiveTime::parse_from_str(time_word, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time_word, "%H:%M:%S"))
        .map_err(|_| BotError::config(format!("not a time of day: {:?}", time_word)))?;

    Ok((weekday, time))
}

/// A union of weekly intervals; the embargo covers a date when any member does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalUnion {
    intervals: Vec<WeeklyInterval>,
}

impl IntervalUnion {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Parse a comma-separated list of intervals.
    pub fn from_human(spec: &str) -> Result<Self, BotError> {
        let intervals = spec
            .split(',')
            .map(WeeklyInterval::from_human)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { intervals })
    }

    pub fn covers(&self, date: DateTime<Utc>) -> bool {
        self.intervals.iter().any(|i| i.covers(date))
    }
}
