use chrono::{DateTime, Datelike, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::ConfigurationError;

/// key: recurrence-rule-model -> scheduled ai generation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub id: i32,
    pub company_id: i32,
    pub channel_id: i32,
    /// 0 = Monday
    pub weekdays: Vec<i32>,
    /// `HH:MM`, 24h, in `timezone`
    pub times: Vec<String>,
    pub timezone: String,
    pub topic: String,
    pub prompt: String,
    pub use_random_context: bool,
    pub publish_immediately: bool,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecurrenceRule {
    pub fn tz(&self) -> Result<Tz, ConfigurationError> {
        resolve_timezone(&self.timezone)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.tz()?;
        if !self.is_active {
            return Ok(());
        }
        if self.weekdays.is_empty() {
            return Err(ConfigurationError::new(format!(
                "rule {} is active without weekdays",
                self.id
            )));
        }
        if let Some(day) = self.weekdays.iter().find(|day| !(0..=6).contains(*day)) {
            return Err(ConfigurationError::new(format!(
                "rule {} has weekday {day} outside 0-6",
                self.id
            )));
        }
        if self.times.is_empty() {
            return Err(ConfigurationError::new(format!(
                "rule {} is active without times",
                self.id
            )));
        }
        for time in &self.times {
            parse_slot(time)?;
        }
        Ok(())
    }

    /// Whether `last_run_at` already falls inside the minute of `instant`.
    pub fn fired_in_minute_of(&self, instant: DateTime<Utc>) -> bool {
        self.last_run_at
            .map(|last| truncate_to_minute(last) == truncate_to_minute(instant))
            .unwrap_or(false)
    }
}

/// key: recurrence-evaluator -> exact minute slot match
///
/// Converts `instant` into the rule's timezone and matches the local weekday and `HH:MM`
/// against the rule. The result depends only on the rule and the instant.
pub fn is_due(rule: &RecurrenceRule, instant: DateTime<Utc>) -> Result<bool, ConfigurationError> {
    if !rule.is_active {
        return Ok(false);
    }
    let tz = rule.tz()?;
    let local = instant.with_timezone(&tz);
    let weekday = local.weekday().num_days_from_monday() as i32;
    let slot = format!("{:02}:{:02}", local.hour(), local.minute());

    Ok(rule.weekdays.contains(&weekday) && rule.times.iter().any(|time| time.trim() == slot))
}

pub fn resolve_timezone(name: &str) -> Result<Tz, ConfigurationError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigurationError::new(format!("unknown timezone `{name}`")))
}

/// Converts a wall-clock instant entered in `timezone` into an absolute instant. Ambiguous
/// local times (DST fall-back) resolve to the earlier instant; skipped ones are rejected.
pub fn local_to_utc(
    local: NaiveDateTime,
    timezone: &str,
) -> Result<DateTime<Utc>, ConfigurationError> {
    let tz = resolve_timezone(timezone)?;
    match tz.from_local_datetime(&local) {
        LocalResult::Single(at) => Ok(at.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(ConfigurationError::new(format!(
            "{local} does not exist in {timezone}"
        ))),
    }
}

fn parse_slot(raw: &str) -> Result<NaiveTime, ConfigurationError> {
    let trimmed = raw.trim();
    if trimmed.len() != 5 {
        return Err(ConfigurationError::new(format!("time `{raw}` is not HH:MM")));
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .map_err(|_| ConfigurationError::new(format!("time `{raw}` is not HH:MM")))
}

fn truncate_to_minute(instant: DateTime<Utc>) -> i64 {
    instant.timestamp().div_euclid(60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn rule(weekdays: Vec<i32>, times: &[&str], timezone: &str) -> RecurrenceRule {
        RecurrenceRule {
            id: 1,
            company_id: 10,
            channel_id: 20,
            weekdays,
            times: times.iter().map(|t| t.to_string()).collect(),
            timezone: timezone.to_string(),
            topic: "weekly digest".into(),
            prompt: String::new(),
            use_random_context: false,
            publish_immediately: true,
            is_active: true,
            last_run_at: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn matches_monday_morning_in_kyiv_summer() {
        let rule = rule(vec![0, 2], &["09:00"], "Europe/Kyiv");
        // 2024-06-03 is a Monday, Kyiv is UTC+3 in summer
        assert!(is_due(&rule, utc(2024, 6, 3, 6, 0, 0)).unwrap());
        assert!(is_due(&rule, utc(2024, 6, 3, 6, 0, 59)).unwrap());
        assert!(!is_due(&rule, utc(2024, 6, 3, 6, 1, 0)).unwrap());
        assert!(!is_due(&rule, utc(2024, 6, 4, 6, 0, 0)).unwrap());
        assert!(is_due(&rule, utc(2024, 6, 5, 6, 0, 0)).unwrap());
    }

    #[test]
    fn follows_the_offset_change_in_winter() {
        let rule = rule(vec![0], &["09:00"], "Europe/Kyiv");
        // 2024-01-15 is a Monday, Kyiv is UTC+2 in winter
        assert!(is_due(&rule, utc(2024, 1, 15, 7, 0, 0)).unwrap());
        assert!(!is_due(&rule, utc(2024, 1, 15, 6, 0, 0)).unwrap());
    }

    #[test]
    fn weekday_is_taken_in_local_time() {
        // Sunday 23:30 UTC is already Monday 08:30 in Tokyo
        let rule = rule(vec![0], &["08:30"], "Asia/Tokyo");
        assert!(is_due(&rule, utc(2024, 6, 2, 23, 30, 0)).unwrap());
        let utc_rule = RecurrenceRule {
            timezone: "UTC".into(),
            ..rule.clone()
        };
        assert!(!is_due(&utc_rule, utc(2024, 6, 2, 23, 30, 0)).unwrap());
    }

    #[test]
    fn inactive_rules_never_fire() {
        let mut rule = rule(vec![0], &["09:00"], "UTC");
        rule.is_active = false;
        assert!(!is_due(&rule, utc(2024, 6, 3, 9, 0, 0)).unwrap());
    }

    #[test]
    fn unknown_timezone_is_a_configuration_error() {
        let rule = rule(vec![0], &["09:00"], "Mars/Olympus");
        let err = is_due(&rule, utc(2024, 6, 3, 9, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
        assert!(rule.validate().is_err());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rule = rule(vec![0, 1, 2, 3, 4, 5, 6], &["00:00", "12:15"], "America/New_York");
        let start = utc(2024, 3, 9, 0, 0, 0);
        for step in 0..(3 * 24 * 60) {
            let at = start + Duration::minutes(step);
            assert_eq!(is_due(&rule, at).unwrap(), is_due(&rule, at).unwrap());
        }
    }

    #[test]
    fn validation_rejects_empty_or_malformed_schedules() {
        assert!(rule(vec![0], &["09:00"], "UTC").validate().is_ok());
        assert!(rule(vec![], &["09:00"], "UTC").validate().is_err());
        assert!(rule(vec![0], &[], "UTC").validate().is_err());
        assert!(rule(vec![7], &["09:00"], "UTC").validate().is_err());
        assert!(rule(vec![0], &["9:00"], "UTC").validate().is_err());
        assert!(rule(vec![0], &["24:00"], "UTC").validate().is_err());

        let mut paused = rule(vec![], &[], "UTC");
        paused.is_active = false;
        assert!(paused.validate().is_ok());
    }

    #[test]
    fn duplicate_guard_compares_minutes() {
        let mut rule = rule(vec![0], &["09:00"], "UTC");
        rule.last_run_at = Some(utc(2024, 6, 3, 9, 0, 41));
        assert!(rule.fired_in_minute_of(utc(2024, 6, 3, 9, 0, 5)));
        assert!(!rule.fired_in_minute_of(utc(2024, 6, 10, 9, 0, 5)));
    }

    #[test]
    fn local_instants_convert_to_utc() {
        let local = NaiveDate::from_ymd_opt(2024, 6, 3)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(
            local_to_utc(local, "Europe/Kyiv").unwrap(),
            utc(2024, 6, 3, 6, 0, 0)
        );

        // 2024-03-31 03:30 is skipped in Kyiv when clocks jump from 03:00 to 04:00
        let skipped = NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_hms_opt(3, 30, 0)
            .unwrap();
        assert!(local_to_utc(skipped, "Europe/Kyiv").is_err());
    }
}
