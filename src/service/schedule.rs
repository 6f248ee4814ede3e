//! Time-of-day schedules for digest and cleanup ticks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};

/// A local wall-clock time, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub const CLEANUP: TimeOfDay = TimeOfDay { hour: 3, minute: 0 };

    /// Six-field cron expression firing daily at this time.
    pub fn to_cron(&self) -> String {
        format!("0 {} {} * * *", self.minute, self.hour)
    }
}

impl FromStr for TimeOfDay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| "expected HH:MM".to_string())?;
        let hour: u32 = h.parse().map_err(|_| format!("bad hour '{h}'"))?;
        let minute: u32 = m.parse().map_err(|_| format!("bad minute '{m}'"))?;
        if hour > 23 || minute > 59 || m.len() != 2 {
            return Err("expected HH:MM between 00:00 and 23:59".into());
        }
        Ok(Self { hour, minute })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// One or more daily fire times.
#[derive(Debug, Clone)]
pub struct DailySchedule {
    times: Vec<TimeOfDay>,
    schedules: Vec<cron::Schedule>,
}

impl DailySchedule {
    pub fn new(times: &[TimeOfDay]) -> Result<Self, String> {
        let schedules = times
            .iter()
            .map(|t| t.to_cron().parse::<cron::Schedule>().map_err(|e| format!("invalid cron: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            times: times.to_vec(),
            schedules,
        })
    }

    /// Parse `HH:MM` entries. Invalid entries are rejected earlier by
    /// config validation.
    pub fn parse(entries: &[String]) -> Result<Self, String> {
        let times = entries
            .iter()
            .map(|e| e.parse::<TimeOfDay>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&times)
    }

    pub fn times(&self) -> &[TimeOfDay] {
        &self.times
    }

    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Earliest fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Local>) -> Option<DateTime<Local>> {
        self.schedules
            .iter()
            .filter_map(|s| s.after(&after).next())
            .min()
    }

    /// Time to wait from `now` until the next fire.
    pub fn until_next(&self, now: DateTime<Local>) -> Option<std::time::Duration> {
        let next = self.next_after(now)?;
        (next - now).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    #[test]
    fn parses_and_displays() {
        let t: TimeOfDay = "08:05".parse().unwrap();
        assert_eq!(t, TimeOfDay { hour: 8, minute: 5 });
        assert_eq!(t.to_string(), "08:05");
        assert_eq!(t.to_cron(), "0 5 8 * * *");
    }

    #[test]
    fn rejects_bad_times() {
        for bad in ["8", "24:00", "12:60", "ab:cd", "12:5"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn next_fire_picks_earliest() {
        let schedule = DailySchedule::parse(&["20:00".into(), "08:00".into()]).unwrap();
        let morning = Local.with_ymd_and_hms(2026, 10, 19, 7, 0, 0).unwrap();
        let next = schedule.next_after(morning).unwrap();
        assert_eq!((next.hour(), next.minute()), (8, 0));

        let evening = Local.with_ymd_and_hms(2026, 10, 19, 21, 0, 0).unwrap();
        let next = schedule.next_after(evening).unwrap();
        assert_eq!((next.hour(), next.minute()), (8, 0));
        assert!(next > evening);
    }

    #[test]
    fn until_next_is_positive() {
        let schedule = DailySchedule::new(&[TimeOfDay::CLEANUP]).unwrap();
        let wait = schedule.until_next(Local::now()).unwrap();
        assert!(wait <= std::time::Duration::from_secs(24 * 3600));
    }

    #[test]
    fn empty_schedule_never_fires() {
        let schedule = DailySchedule::parse(&[]).unwrap();
        assert!(schedule.is_empty());
        assert!(schedule.next_after(Local::now()).is_none());
    }
}
