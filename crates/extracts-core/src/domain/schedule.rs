//! Persisted run-state of a recurring task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-of-day window, written as `HH:MM-HH:MM`.
///
/// When `start > end` the window wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInterval {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ActiveInterval {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Membership test.
    ///
    /// Plain windows are half-open `[start, end)`. Wrapping windows accept
    /// `now >= start || now <= end`. Equal bounds mean the whole day.
    pub fn contains(&self, now: NaiveTime) -> bool {
        if self.start == self.end {
            return true;
        }
        if self.wraps_midnight() {
            now >= self.start || now <= self.end
        } else {
            self.start <= now && now < self.end
        }
    }
}

impl fmt::Display for ActiveInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

impl FromStr for ActiveInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected HH:MM-HH:MM, got '{s}'"))?;
        Ok(Self::new(parse_hhmm(start)?, parse_hhmm(end)?))
    }
}

/// Parse `HH:MM`.
pub fn parse_hhmm(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| format!("invalid time '{s}': {e}"))
}

/// Why a gate allowed or refused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    Run,
    /// No record for the task name.
    Missing,
    Inactive,
    OutsideWindow,
    /// A previous run started and has not completed.
    InFlight,
}

impl GateDecision {
    pub fn allows_run(self) -> bool {
        self == GateDecision::Run
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    pub task_name: String,
    pub interval: ActiveInterval,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_completed_at: Option<DateTime<Utc>>,
}

impl ScheduleRecord {
    pub fn new(task_name: impl Into<String>, interval: ActiveInterval) -> Self {
        Self {
            task_name: task_name.into(),
            interval,
            is_active: true,
            last_run_at: None,
            last_run_completed_at: None,
        }
    }

    /// Single-flight check: no run started, or the last start has completed.
    pub fn can_run(&self) -> bool {
        match (self.last_run_at, self.last_run_completed_at) {
            (None, _) => true,
            (Some(started), Some(completed)) => completed >= started,
            (Some(_), None) => false,
        }
    }

    /// Evaluate the three checks in order: active flag, window, single-flight.
    pub fn evaluate(&self, local_time: NaiveTime) -> GateDecision {
        if !self.is_active {
            GateDecision::Inactive
        } else if !self.interval.contains(local_time) {
            GateDecision::OutsideWindow
        } else if !self.can_run() {
            GateDecision::InFlight
        } else {
            GateDecision::Run
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn t(s: &str) -> NaiveTime {
        parse_hhmm(s).unwrap()
    }

    #[rstest]
    #[case::late_evening("23:00", true)]
    #[case::small_hours("03:00", true)]
    #[case::noon("12:00", false)]
    #[case::start_boundary("20:00", true)]
    #[case::end_boundary("07:00", true)]
    #[case::just_after_end("07:01", false)]
    fn wrapping_window(#[case] now: &str, #[case] expected: bool) {
        let window: ActiveInterval = "20:00-07:00".parse().unwrap();
        assert!(window.wraps_midnight());
        assert_eq!(window.contains(t(now)), expected);
    }

    #[rstest]
    #[case::inside("10:30", true)]
    #[case::start_is_inclusive("09:00", true)]
    #[case::end_is_exclusive("18:00", false)]
    #[case::before("08:59", false)]
    fn plain_window_is_half_open(#[case] now: &str, #[case] expected: bool) {
        let window: ActiveInterval = "09:00-18:00".parse().unwrap();
        assert_eq!(window.contains(t(now)), expected);
    }

    #[test]
    fn equal_bounds_cover_the_whole_day() {
        let window: ActiveInterval = "00:00-00:00".parse().unwrap();
        assert!(window.contains(t("13:37")));
    }

    #[test]
    fn malformed_windows_are_rejected() {
        assert!("20:00".parse::<ActiveInterval>().is_err());
        assert!("25:00-07:00".parse::<ActiveInterval>().is_err());
    }

    #[test]
    fn single_flight_follows_timestamps() {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap();
        let mut record = ScheduleRecord::new("order-status-checker", "20:00-07:00".parse().unwrap());
        assert!(record.can_run());

        record.last_run_at = Some(started);
        assert!(!record.can_run());
        assert_eq!(record.evaluate(t("23:00")), GateDecision::InFlight);

        record.last_run_completed_at = Some(started + Duration::minutes(3));
        assert!(record.can_run());
        assert_eq!(record.evaluate(t("23:00")), GateDecision::Run);
    }

    #[test]
    fn inactive_wins_over_other_checks() {
        let mut record = ScheduleRecord::new("x", "20:00-07:00".parse().unwrap());
        record.is_active = false;
        assert_eq!(record.evaluate(t("12:00")), GateDecision::Inactive);
        record.is_active = true;
        assert_eq!(record.evaluate(t("12:00")), GateDecision::OutsideWindow);
    }
}
