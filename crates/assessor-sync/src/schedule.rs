//! Recurrence expressions and persisted schedule state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Validated recurrence expression
///
/// Accepts classic 5-field cron (minute precision, day of week `0`-`7`
/// with both `0` and `7` meaning Sunday), 6/7-field cron with seconds and
/// optional year (day of week `1`-`7` from Sunday, as the `cron` crate
/// reads it), and the `@hourly`, `@daily`, `@weekly`, `@monthly`,
/// `@yearly` aliases.
#[derive(Debug, Clone)]
pub struct Recurrence {
    expression: String,
    schedule: cron::Schedule,
}

impl Recurrence {
    pub fn parse(expression: &str) -> SyncResult<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(invalid(expression, "expression is empty"));
        }

        let normalized = normalize(expression)?;
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| invalid(expression, &e.to_string()))?;

        // A syntactically valid expression can still never fire (Feb 30th).
        if schedule.upcoming(Utc).next().is_none() {
            return Err(invalid(expression, "expression never fires"));
        }

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// Expression as supplied by the operator
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&after).take(count).collect()
    }
}

impl FromStr for Recurrence {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn invalid(expression: &str, reason: &str) -> SyncError {
    SyncError::config(format!("Invalid recurrence expression '{}': {}", expression, reason))
}

fn normalize(expression: &str) -> SyncResult<String> {
    let alias = match expression.to_lowercase().as_str() {
        "@hourly" => Some("0 0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 0 * * *"),
        "@weekly" => Some("0 0 0 * * Sun"),
        "@monthly" => Some("0 0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 0 1 1 *"),
        _ => None,
    };
    if let Some(alias) = alias {
        return Ok(alias.to_string());
    }
    if expression.starts_with('@') {
        return Err(invalid(expression, "unknown alias"));
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let weekdays = classic_weekdays(fields[4]).map_err(|reason| invalid(expression, &reason))?;
            Ok(format!("0 {} {}", fields[..4].join(" "), weekdays))
        },
        6 | 7 => Ok(expression.to_string()),
        n => Err(invalid(
            expression,
            &format!("expected 5, 6 or 7 fields, found {}", n),
        )),
    }
}

const WEEKDAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrite a classic day-of-week field as an explicit list of day names
///
/// Classic cron counts `0`-`6` from Sunday and also accepts `7` for
/// Sunday; names remove any doubt about the numbering downstream.
fn classic_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| format!("invalid day-of-week step in '{}'", item))?;
                (range, step)
            },
            None => (item, 1),
        };

        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((start, end)) => (weekday_number(start)?, weekday_number(end)?),
                // "N/S" runs from N to the end of the week
                None if step > 1 => (weekday_number(range)?, 6),
                None => {
                    let day = weekday_number(range)?;
                    (day, day)
                },
            },
        };
        if start > end {
            return Err(format!("day-of-week range '{}' runs backwards", range));
        }

        for day in (start..=end).step_by(step as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    Ok(WEEKDAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(","))
}

/// `0`-`7` or a three-letter day name; 7 is kept so `5-7` stays a range
fn weekday_number(value: &str) -> Result<u32, String> {
    if let Ok(n) = value.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day of week {} is out of range 0-7", n))
        };
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .map(|i| i as u32)
        .ok_or_else(|| format!("unknown day of week '{}'", value))
}

/// Schedule shared by every `assessor` process through the state directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    pub expression: Option<String>,
    pub enabled: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ScheduleState {
    /// Load the state, treating a missing file as "never scheduled"
    pub fn load(path: &Path) -> SyncResult<Self> {
        Ok(assessor_common::state::load_json(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        assessor_common::state::save_json(path, self)?;
        Ok(())
    }

    /// Active recurrence, if scheduling is enabled and the stored
    /// expression is still valid
    pub fn active(&self) -> Option<Recurrence> {
        if !self.enabled {
            return None;
        }
        self.expression
            .as_deref()
            .and_then(|expr| Recurrence::parse(expr).ok())
    }
}
