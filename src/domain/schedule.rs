//! Time-of-day × priority → maximum-current schedule.
//!
//! Text form (one schedule): `INTERVAL;INTERVAL;…` where
//! `INTERVAL = HH:MM-HH:MM>PRIO=CAP[:PRIO=CAP]*`. Priorities and caps are
//! non-negative integers; priorities must ascend within an interval, and the
//! intervals together must tile `00:00`-`24:00` with no gap or overlap.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use thiserror::Error;

const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("malformed interval token: {0}")]
    Malformed(String),
    #[error("priorities not ascending within interval {0}")]
    NonAscendingPriority(String),
    #[error("gap between {0} and {1}")]
    Gap(String, String),
    #[error("overlap between {0} and {1}")]
    Overlap(String, String),
    #[error("schedule does not cover 00:00-23:59")]
    IncompleteCoverage,
    #[error("schedule has no intervals")]
    Empty,
}

/// One `priority_threshold => current_cap_A` tier, ascending by priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub priority: i32,
    pub cap_a: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    /// Minutes since midnight, half-open `[start, end)`.
    pub start_min: u32,
    pub end_min: u32,
    pub tiers: Vec<Tier>,
}

impl Interval {
    fn cap_at(&self, priority: i32) -> u32 {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.priority <= priority)
            .map(|t| t.cap_a)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Sorted ascending by `start_min`, covering the full day with no gaps.
    intervals: Vec<Interval>,
}

fn fmt_hhmm(min: u32) -> String {
    format!("{:02}:{:02}", min / 60, min % 60)
}

fn parse_hhmm(s: &str) -> Result<u32, ScheduleError> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| ScheduleError::Malformed(s.to_string()))?;
    let h: u32 = h.parse().map_err(|_| ScheduleError::Malformed(s.to_string()))?;
    let m: u32 = m.parse().map_err(|_| ScheduleError::Malformed(s.to_string()))?;
    if h > 24 || m > 59 || (h == 24 && m != 0) {
        return Err(ScheduleError::Malformed(s.to_string()));
    }
    Ok(h * 60 + m)
}

impl Schedule {
    /// Returns the cap for a given time of day and session priority: the
    /// interval covering `minute_of_day`, then its greatest threshold ≤
    /// `priority`. 0 if no threshold qualifies.
    pub fn cap_at_minute(&self, minute_of_day: u32, priority: i32) -> u32 {
        let minute_of_day = minute_of_day % MINUTES_PER_DAY;
        self.intervals
            .iter()
            .find(|iv| minute_of_day >= iv.start_min && minute_of_day < iv.end_min)
            .map(|iv| iv.cap_at(priority))
            .unwrap_or(0)
    }

    pub fn cap_at(&self, now: DateTime<Utc>, priority: i32) -> u32 {
        self.cap_at_minute(now.hour() * 60 + now.minute(), priority)
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    fn validate_coverage(intervals: &[Interval]) -> Result<(), ScheduleError> {
        if intervals.is_empty() {
            return Err(ScheduleError::Empty);
        }
        let mut sorted = intervals.to_vec();
        sorted.sort_by_key(|iv| iv.start_min);
        if sorted[0].start_min != 0 {
            return Err(ScheduleError::Gap("00:00".into(), fmt_hhmm(sorted[0].start_min)));
        }
        for pair in sorted.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.start_min > a.end_min {
                return Err(ScheduleError::Gap(fmt_hhmm(a.end_min), fmt_hhmm(b.start_min)));
            }
            if b.start_min < a.end_min {
                return Err(ScheduleError::Overlap(fmt_hhmm(a.end_min), fmt_hhmm(b.start_min)));
            }
        }
        if sorted.last().unwrap().end_min != MINUTES_PER_DAY {
            return Err(ScheduleError::IncompleteCoverage);
        }
        Ok(())
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut intervals = Vec::new();
        for token in s.split(';').filter(|t| !t.is_empty()) {
            let (range, tiers_str) = token
                .split_once('>')
                .ok_or_else(|| ScheduleError::Malformed(token.to_string()))?;
            let (start_str, end_str) = range
                .split_once('-')
                .ok_or_else(|| ScheduleError::Malformed(token.to_string()))?;
            let start_min = parse_hhmm(start_str)?;
            let end_min = parse_hhmm(end_str)?;
            if end_min <= start_min {
                return Err(ScheduleError::Malformed(token.to_string()));
            }

            let mut tiers = Vec::new();
            for tier_tok in tiers_str.split(':') {
                let (p, c) = tier_tok
                    .split_once('=')
                    .ok_or_else(|| ScheduleError::Malformed(tier_tok.to_string()))?;
                let priority: i32 = p.parse().map_err(|_| ScheduleError::Malformed(tier_tok.to_string()))?;
                let cap_a: u32 = c.parse().map_err(|_| ScheduleError::Malformed(tier_tok.to_string()))?;
                tiers.push(Tier { priority, cap_a });
            }
            if tiers.is_empty() {
                return Err(ScheduleError::Malformed(token.to_string()));
            }
            if tiers.windows(2).any(|w| w[0].priority >= w[1].priority) {
                return Err(ScheduleError::NonAscendingPriority(token.to_string()));
            }

            intervals.push(Interval { start_min, end_min, tiers });
        }

        Schedule::validate_coverage(&intervals)?;
        intervals.sort_by_key(|iv| iv.start_min);
        Ok(Schedule { intervals })
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .intervals
            .iter()
            .map(|iv| {
                let tiers = iv
                    .tiers
                    .iter()
                    .map(|t| format!("{}={}", t.priority, t.cap_a))
                    .collect::<Vec<_>>()
                    .join(":");
                format!("{}-{}>{}", fmt_hhmm(iv.start_min), fmt_hhmm(iv.end_min), tiers)
            })
            .collect();
        write!(f, "{}", rendered.join(";"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_interval_covering_day() {
        let sched: Schedule = "00:00-24:00>0=24".parse().unwrap();
        assert_eq!(sched.cap_at_minute(0, 0), 24);
        assert_eq!(sched.cap_at_minute(23 * 60 + 59, 0), 24);
    }

    #[test]
    fn selects_greatest_threshold_not_exceeding_priority() {
        let sched: Schedule = "17:00-20:59>0=0:5=48;00:00-16:59>0=32;21:00-23:59>0=32".parse().unwrap();
        assert_eq!(sched.cap_at_minute(18 * 60, 1), 0);
        assert_eq!(sched.cap_at_minute(18 * 60, 5), 48);
        assert_eq!(sched.cap_at_minute(18 * 60, 9), 48);
    }

    #[test]
    fn rejects_gap() {
        let err = "00:00-10:00>0=10;10:30-24:00>0=10".parse::<Schedule>().unwrap_err();
        assert!(matches!(err, ScheduleError::Gap(_, _)));
    }

    #[test]
    fn rejects_overlap() {
        let err = "00:00-10:30>0=10;10:00-24:00>0=10".parse::<Schedule>().unwrap_err();
        assert!(matches!(err, ScheduleError::Overlap(_, _)));
    }

    #[test]
    fn rejects_non_ascending_priorities() {
        let err = "00:00-24:00>5=10:0=20".parse::<Schedule>().unwrap_err();
        assert_eq!(err, ScheduleError::NonAscendingPriority("00:00-24:00>5=10:0=20".into()));
    }

    #[test]
    fn rejects_incomplete_coverage() {
        let err = "00:00-23:00>0=10".parse::<Schedule>().unwrap_err();
        assert_eq!(err, ScheduleError::IncompleteCoverage);
    }

    #[test]
    fn round_trip_preserves_cap_at() {
        let original = "00:00-08:00>0=6:3=16;08:00-17:00>0=0:2=10:7=32;17:00-24:00>0=6";
        let parsed: Schedule = original.parse().unwrap();
        let reserialized = parsed.to_string();
        let reparsed: Schedule = reserialized.parse().unwrap();

        for minute in (0..MINUTES_PER_DAY).step_by(17) {
            for priority in -2..10 {
                assert_eq!(
                    parsed.cap_at_minute(minute, priority),
                    reparsed.cap_at_minute(minute, priority)
                );
            }
        }
    }

    #[test]
    fn unschedulable_priority_returns_zero() {
        let sched: Schedule = "00:00-24:00>3=10".parse().unwrap();
        assert_eq!(sched.cap_at_minute(0, 0), 0);
    }
}
