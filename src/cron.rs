//! 5-field cron schedule parsing and the "should fire now" gate.
//!
//! Fields are minute, hour, day-of-month, month, day-of-week (0 = Sunday).
//! Each field supports `*`, exact integers, comma lists, inclusive ranges
//! (`a-b`), and step syntax (`*/n`). The gate answers a boolean and never
//! mutates state.

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cron expression '{expression}' must have 5 fields"))]
    FieldCount { expression: String },

    #[snafu(display("invalid cron field '{field}': {message}"))]
    InvalidField { field: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// How far the general scan looks ahead for the next matching minute.
const SCAN_HORIZON_MINUTES: i64 = 24 * 60;

/// A parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct Schedule {
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    /// Set when the minute field is exactly `*/n`; enables the fast path.
    minute_step: Option<u32>,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        ensure!(
            fields.len() == 5,
            FieldCountSnafu {
                expression: expression.to_string()
            }
        );

        let minute_step = fields[0]
            .strip_prefix("*/")
            .and_then(|n| n.parse::<u32>().ok())
            .filter(|n| *n > 0);

        Ok(Schedule {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            days_of_month: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            days_of_week: parse_field(fields[4], 0, 6)?,
            minute_step,
        })
    }

    /// Whether all five fields match the given instant.
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minutes[t.minute() as usize]
            && self.hours[t.hour() as usize]
            && self.days_of_month[t.day() as usize - 1]
            && self.months[t.month() as usize - 1]
            && self.days_of_week[t.weekday().num_days_from_sunday() as usize]
    }

    /// First matching minute at or after `last_run + 1 minute`, scanning up
    /// to 24 h forward. For a `*/n` minute field the step arithmetic short
    /// circuits the scan; `*/1` deliberately yields an instant in the past
    /// once a minute has elapsed, which reads as "fire now".
    pub fn next_fire(&self, last_run: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = last_run
            .duration_trunc(Duration::minutes(1))
            .unwrap_or(last_run);

        if let Some(step) = self.minute_step {
            if step == 1 {
                return Some(floor + Duration::minutes(1));
            }
            let offset = step - last_run.minute() % step;
            return Some(floor + Duration::minutes(i64::from(offset)));
        }

        for i in 1..=SCAN_HORIZON_MINUTES {
            let candidate = floor + Duration::minutes(i);
            if self.matches(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// The gate: a workflow with no recorded run fires immediately;
    /// otherwise it is due once `now` has reached the next fire time.
    pub fn should_fire(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        match last_run {
            None => true,
            Some(last) => self.next_fire(last).is_some_and(|next| now >= next),
        }
    }
}

/// Parse one cron field into a membership table over `min..=max`.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<bool>> {
    let size = (max - min + 1) as usize;
    let mut allowed = vec![false; size];

    for part in field.split(',') {
        if part == "*" {
            allowed.iter_mut().for_each(|slot| *slot = true);
        } else if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step.parse().ok().filter(|n| *n > 0).with_context(|| {
                InvalidFieldSnafu {
                    field: field.to_string(),
                    message: format!("bad step '{part}'"),
                }
            })?;
            for v in (min..=max).step_by(step as usize) {
                allowed[(v - min) as usize] = true;
            }
        } else if let Some((lo, hi)) = part.split_once('-') {
            let lo = parse_value(lo, min, max, field)?;
            let hi = parse_value(hi, min, max, field)?;
            ensure!(
                lo <= hi,
                InvalidFieldSnafu {
                    field: field.to_string(),
                    message: format!("range '{part}' is inverted"),
                }
            );
            for v in lo..=hi {
                allowed[(v - min) as usize] = true;
            }
        } else {
            let v = parse_value(part, min, max, field)?;
            allowed[(v - min) as usize] = true;
        }
    }

    Ok(allowed)
}

fn parse_value(raw: &str, min: u32, max: u32, field: &str) -> Result<u32> {
    let v: u32 = raw.parse().ok().with_context(|| InvalidFieldSnafu {
        field: field.to_string(),
        message: format!("'{raw}' is not an integer"),
    })?;
    ensure!(
        (min..=max).contains(&v),
        InvalidFieldSnafu {
            field: field.to_string(),
            message: format!("{v} is outside {min}..={max}"),
        }
    );
    Ok(v)
}
