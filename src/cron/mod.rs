use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Parsed recurring schedule. Job authors write classic 5-field expressions
/// (minute hour day month dow); the `cron` crate wants a seconds field, so
/// 5-field input is normalized to fire at second zero. 6- and 7-field
/// expressions pass through unchanged.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<CronSchedule, String> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err("cron expression is empty".to_string());
        }

        let field_count = trimmed.split_whitespace().count();
        let normalized = match field_count {
            5 => format!("0 {}", trimmed),
            6 | 7 => trimmed.to_string(),
            other => {
                return Err(format!(
                    "cron expression must have 5, 6 or 7 fields, found {}",
                    other
                ))
            }
        };

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| format!("invalid cron expression '{}': {}", trimmed, e))?;

        Ok(CronSchedule { schedule })
    }

    /// Next occurrence strictly after `after`, if the schedule ever fires
    /// again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}
