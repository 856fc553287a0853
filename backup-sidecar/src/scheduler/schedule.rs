//! Schedule policies and the pure scheduling state machine.
//!
//! `ScheduleState::tick` decides whether a backup run is due at a given
//! instant. It never reads the clock itself, so every policy can be driven
//! with fixed timestamps.

use chrono::{
    DateTime, Datelike, Days, Duration as ChronoDuration, LocalResult, NaiveDateTime, NaiveTime,
    TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Default fixed interval: 12 hours.
pub const DEFAULT_INTERVAL_SECS: u64 = 43_200;

/// Longest accepted fixed interval: 366 days.
pub const MAX_INTERVAL_SECS: u64 = 31_622_400;

/// Default time of day for daily and calendar schedules.
pub const DEFAULT_TIME: &str = "03:00";

/// Calendar granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Daily,
    /// Sundays only
    Weekly,
}

impl IntervalUnit {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            _ => None,
        }
    }
}

/// When backups run. One policy per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Interval(Duration),
    DailyAt { at: NaiveTime, tz: Tz },
    Calendar { unit: IntervalUnit, at: NaiveTime, tz: Tz },
}

impl Schedule {
    /// Fixed interval from a seconds string. Missing, zero, oversized or
    /// malformed values use the default.
    pub fn interval_from(seconds: Option<&str>) -> Self {
        let secs = match seconds {
            None => DEFAULT_INTERVAL_SECS,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 && secs <= MAX_INTERVAL_SECS => secs,
                _ => {
                    warn!(value = raw, default = DEFAULT_INTERVAL_SECS, "Invalid backup interval, using default");
                    DEFAULT_INTERVAL_SECS
                }
            },
        };
        Schedule::Interval(Duration::from_secs(secs))
    }

    pub fn daily_from(time: Option<&str>, timezone: Option<&str>) -> Self {
        Schedule::DailyAt {
            at: time_or_default(time),
            tz: timezone_or_default(timezone),
        }
    }

    pub fn calendar_from(unit: Option<&str>, time: Option<&str>, timezone: Option<&str>) -> Self {
        let unit = match unit {
            None => IntervalUnit::Weekly,
            Some(raw) => IntervalUnit::parse(raw).unwrap_or_else(|| {
                warn!(value = raw, "Unsupported schedule interval, falling back to weekly");
                IntervalUnit::Weekly
            }),
        };

        Schedule::Calendar {
            unit,
            at: time_or_default(time),
            tz: timezone_or_default(timezone),
        }
    }

    /// Fire time following a run that was due at `previous` and started at
    /// `now`. Calendar schedules pick their next occurrence after `now`;
    /// interval schedules stay anchored on `previous`.
    pub fn next_after(&self, previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::Interval(every) => next_interval_fire(previous, *every, now),
            Schedule::DailyAt { at, tz } => next_occurrence(now, *at, *tz, false),
            Schedule::Calendar { unit, at, tz } => {
                next_occurrence(now, *at, *tz, *unit == IntervalUnit::Weekly)
            }
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(every) => write!(f, "every {}s", every.as_secs()),
            Schedule::DailyAt { at, tz } => write!(f, "daily at {} ({})", at.format("%H:%M"), tz.name()),
            Schedule::Calendar { unit: IntervalUnit::Daily, at, tz } => {
                write!(f, "daily at {} ({})", at.format("%H:%M"), tz.name())
            }
            Schedule::Calendar { unit: IntervalUnit::Weekly, at, tz } => {
                write!(f, "weekly on Sunday at {} ({})", at.format("%H:%M"), tz.name())
            }
        }
    }
}

/// Parse `HH:MM`.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M").ok()
}

fn default_time() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default()
}

fn time_or_default(raw: Option<&str>) -> NaiveTime {
    match raw {
        None => default_time(),
        Some(raw) => parse_time_of_day(raw).unwrap_or_else(|| {
            warn!(value = raw, default = DEFAULT_TIME, "Invalid time format, expected HH:MM");
            default_time()
        }),
    }
}

fn timezone_or_default(raw: Option<&str>) -> Tz {
    match raw {
        None => Tz::UTC,
        Some(raw) => raw.trim().parse::<Tz>().unwrap_or_else(|_| {
            warn!(value = raw, "Unknown timezone, falling back to UTC");
            Tz::UTC
        }),
    }
}

fn default_step() -> ChronoDuration {
    ChronoDuration::seconds(DEFAULT_INTERVAL_SECS as i64)
}

/// First slot of `every` after `now`, counted from the previous fire time so
/// that late ticks neither drift nor burst. Falls back to `now` plus the
/// default interval when the arithmetic leaves chrono's range.
fn next_interval_fire(previous: DateTime<Utc>, every: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let step_ms = ChronoDuration::from_std(every)
        .unwrap_or_else(|_| default_step())
        .num_milliseconds()
        .max(1);
    let behind_ms = (now - previous).num_milliseconds().max(0);
    let slots = behind_ms / step_ms + 1;

    step_ms
        .checked_mul(slots)
        .and_then(ChronoDuration::try_milliseconds)
        .and_then(|advance| previous.checked_add_signed(advance))
        .unwrap_or_else(|| {
            warn!(interval_secs = every.as_secs(), "Backup interval out of range, using default");
            now + default_step()
        })
}

/// First instant after `after` whose local time in `tz` is `at`, optionally
/// restricted to Sundays.
fn next_occurrence(after: DateTime<Utc>, at: NaiveTime, tz: Tz, sundays_only: bool) -> DateTime<Utc> {
    let start = after.with_timezone(&tz).date_naive();

    for offset in 0..=14 {
        let Some(date) = start.checked_add_days(Days::new(offset)) else {
            break;
        };
        if sundays_only && date.weekday() != Weekday::Sun {
            continue;
        }
        if let Some(candidate) = resolve_local(tz, date.and_time(at)) {
            if candidate > after {
                return candidate;
            }
        }
    }

    after + ChronoDuration::days(1)
}

/// Map a local wall-clock time to UTC. Ambiguous times take the earlier
/// instant; times inside a DST gap move to the first valid minute after it.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => (1..=180)
            .find_map(|minutes| {
                tz.from_local_datetime(&(local + ChronoDuration::minutes(minutes)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// Outcome of one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Wait,
    RunNow,
}

/// Scheduling state: the active policy, the next fire time, and whether a
/// one-off start-up run is still owed.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    schedule: Schedule,
    next_fire: DateTime<Utc>,
    immediate_pending: bool,
}

impl ScheduleState {
    /// Interval schedules fire at `now`. Daily and calendar schedules fire at
    /// their next occurrence, plus once right away when `immediate` is set.
    pub fn new(schedule: Schedule, now: DateTime<Utc>, immediate: bool) -> Self {
        let (next_fire, immediate_pending) = match &schedule {
            Schedule::Interval(_) => (now, false),
            calendar => (calendar.next_after(now, now), immediate),
        };

        Self {
            schedule,
            next_fire,
            immediate_pending,
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn next_fire(&self) -> DateTime<Utc> {
        self.next_fire
    }

    /// Decide whether to run at `now`, advancing the next fire time if so.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Action {
        if self.immediate_pending {
            self.immediate_pending = false;
            return Action::RunNow;
        }

        if now < self.next_fire {
            return Action::Wait;
        }

        self.next_fire = self.schedule.next_after(self.next_fire, now);

        Action::RunNow
    }

    /// How long the driver may sleep before the next tick, capped at `poll`.
    pub fn sleep_for(&self, now: DateTime<Utc>, poll: Duration) -> Duration {
        if self.immediate_pending {
            return Duration::ZERO;
        }
        (self.next_fire - now).to_std().unwrap_or(Duration::ZERO).min(poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_interval_fires_at_start_then_every_interval() {
        let start = utc(2024, 3, 1, 0, 0, 0);
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(5)), start, false);

        assert_eq!(state.tick(start), Action::RunNow);
        assert_eq!(state.tick(start + ChronoDuration::seconds(4)), Action::Wait);
        assert_eq!(state.tick(start + ChronoDuration::seconds(5)), Action::RunNow);
        assert_eq!(state.tick(start + ChronoDuration::seconds(9)), Action::Wait);
        assert_eq!(state.tick(start + ChronoDuration::seconds(10)), Action::RunNow);
        assert_eq!(state.next_fire(), start + ChronoDuration::seconds(15));
    }

    #[test]
    fn test_interval_does_not_drift_when_late() {
        let start = utc(2024, 3, 1, 0, 0, 0);
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(5)), start, false);

        assert_eq!(state.tick(start + ChronoDuration::milliseconds(900)), Action::RunNow);
        assert_eq!(state.next_fire(), start + ChronoDuration::seconds(5));

        assert_eq!(state.tick(start + ChronoDuration::milliseconds(5_900)), Action::RunNow);
        assert_eq!(state.next_fire(), start + ChronoDuration::seconds(10));
    }

    #[test]
    fn test_interval_skips_missed_slots_without_burst() {
        let start = utc(2024, 3, 1, 0, 0, 0);
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(5)), start, false);
        state.tick(start);

        // A run that overran three slots fires once, then realigns.
        let late = start + ChronoDuration::seconds(17);
        assert_eq!(state.tick(late), Action::RunNow);
        assert_eq!(state.next_fire(), start + ChronoDuration::seconds(20));
        assert_eq!(state.tick(late), Action::Wait);
    }

    #[test]
    fn test_interval_ignores_immediate_flag() {
        let start = utc(2024, 3, 1, 0, 0, 0);
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(60)), start, true);

        assert_eq!(state.tick(start), Action::RunNow);
        assert_eq!(state.tick(start), Action::Wait);
    }

    #[test]
    fn test_daily_fires_once_per_day() {
        let now = utc(2024, 3, 1, 2, 0, 0);
        let schedule = Schedule::DailyAt { at: hm(3, 0), tz: Tz::UTC };
        let mut state = ScheduleState::new(schedule, now, false);

        assert_eq!(state.next_fire(), utc(2024, 3, 1, 3, 0, 0));
        assert_eq!(state.tick(utc(2024, 3, 1, 2, 59, 0)), Action::Wait);
        assert_eq!(state.tick(utc(2024, 3, 1, 3, 0, 30)), Action::RunNow);
        assert_eq!(state.next_fire(), utc(2024, 3, 2, 3, 0, 0));
        assert_eq!(state.tick(utc(2024, 3, 1, 3, 1, 30)), Action::Wait);
    }

    #[test]
    fn test_daily_respects_timezone() {
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let schedule = Schedule::DailyAt { at: hm(3, 0), tz: berlin };

        // CET is UTC+1 in March before the switch.
        let state = ScheduleState::new(schedule, utc(2024, 3, 1, 0, 0, 0), false);
        assert_eq!(state.next_fire(), utc(2024, 3, 1, 2, 0, 0));
    }

    #[test]
    fn test_daily_time_already_passed_rolls_to_tomorrow() {
        let schedule = Schedule::DailyAt { at: hm(3, 0), tz: Tz::UTC };
        let state = ScheduleState::new(schedule, utc(2024, 3, 1, 3, 0, 0), false);
        assert_eq!(state.next_fire(), utc(2024, 3, 2, 3, 0, 0));
    }

    #[test]
    fn test_weekly_fires_on_sunday() {
        // 2024-03-01 is a Friday.
        let schedule = Schedule::Calendar { unit: IntervalUnit::Weekly, at: hm(3, 0), tz: Tz::UTC };
        let mut state = ScheduleState::new(schedule, utc(2024, 3, 1, 12, 0, 0), false);
        assert_eq!(state.next_fire(), utc(2024, 3, 3, 3, 0, 0));

        assert_eq!(state.tick(utc(2024, 3, 3, 3, 0, 0)), Action::RunNow);
        assert_eq!(state.next_fire(), utc(2024, 3, 10, 3, 0, 0));
    }

    #[test]
    fn test_weekly_later_on_sunday() {
        let schedule = Schedule::Calendar { unit: IntervalUnit::Weekly, at: hm(22, 30), tz: Tz::UTC };
        let state = ScheduleState::new(schedule, utc(2024, 3, 3, 8, 0, 0), false);
        assert_eq!(state.next_fire(), utc(2024, 3, 3, 22, 30, 0));
    }

    #[test]
    fn test_calendar_daily_unit() {
        let schedule = Schedule::calendar_from(Some("daily"), Some("23:15"), Some("UTC"));
        let state = ScheduleState::new(schedule, utc(2024, 3, 1, 23, 20, 0), false);
        assert_eq!(state.next_fire(), utc(2024, 3, 2, 23, 15, 0));
    }

    #[test]
    fn test_calendar_falls_back_on_invalid_input() {
        let schedule = Schedule::calendar_from(Some("monthly"), Some("25:99"), Some("Mars/Olympus"));
        assert_eq!(
            schedule,
            Schedule::Calendar { unit: IntervalUnit::Weekly, at: hm(3, 0), tz: Tz::UTC }
        );
    }

    #[test]
    fn test_calendar_defaults() {
        let schedule = Schedule::calendar_from(None, None, None);
        assert_eq!(
            schedule,
            Schedule::Calendar { unit: IntervalUnit::Weekly, at: hm(3, 0), tz: Tz::UTC }
        );
    }

    #[test]
    fn test_daily_invalid_time_falls_back() {
        let schedule = Schedule::daily_from(Some("7pm"), Some("Asia/Tokyo"));
        let tokyo: Tz = "Asia/Tokyo".parse().unwrap();
        assert_eq!(schedule, Schedule::DailyAt { at: hm(3, 0), tz: tokyo });
    }

    #[test]
    fn test_interval_from_invalid_values() {
        let default = Schedule::Interval(Duration::from_secs(DEFAULT_INTERVAL_SECS));
        assert_eq!(Schedule::interval_from(None), default);
        assert_eq!(Schedule::interval_from(Some("soon")), default);
        assert_eq!(Schedule::interval_from(Some("0")), default);
        assert_eq!(Schedule::interval_from(Some("300")), Schedule::Interval(Duration::from_secs(300)));
    }

    #[test]
    fn test_interval_from_oversized_value_uses_default() {
        let default = Schedule::Interval(Duration::from_secs(DEFAULT_INTERVAL_SECS));
        assert_eq!(Schedule::interval_from(Some("10000000000000")), default);
        assert_eq!(Schedule::interval_from(Some("18446744073709551615")), default);
        assert_eq!(
            Schedule::interval_from(Some(&MAX_INTERVAL_SECS.to_string())),
            Schedule::Interval(Duration::from_secs(MAX_INTERVAL_SECS))
        );
    }

    #[test]
    fn test_interval_tick_survives_out_of_range_interval() {
        let start = utc(2024, 3, 1, 0, 0, 0);
        let step = ChronoDuration::seconds(DEFAULT_INTERVAL_SECS as i64);

        // Fits chrono's duration range but overflows the date range.
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(9_000_000_000_000)), start, false);
        assert_eq!(state.tick(start), Action::RunNow);
        assert_eq!(state.next_fire(), start + step);

        // Does not fit a chrono duration at all.
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(u64::MAX / 2)), start, false);
        assert_eq!(state.tick(start), Action::RunNow);
        assert_eq!(state.next_fire(), start + step);
        assert_eq!(state.tick(start + ChronoDuration::seconds(1)), Action::Wait);
    }

    #[test]
    fn test_next_after_anchors() {
        let previous = utc(2024, 3, 1, 11, 59, 0);
        let now = utc(2024, 3, 1, 12, 0, 30);

        // Interval: next slot counted from the previous fire time.
        assert_eq!(
            Schedule::Interval(Duration::from_secs(60)).next_after(previous, now),
            utc(2024, 3, 1, 12, 1, 0)
        );
        // Calendar: next occurrence after the current instant.
        assert_eq!(
            Schedule::DailyAt { at: hm(3, 0), tz: Tz::UTC }.next_after(previous, now),
            utc(2024, 3, 2, 3, 0, 0)
        );
    }

    #[test]
    fn test_immediate_runs_once_in_addition_to_schedule() {
        let now = utc(2024, 3, 1, 12, 0, 0);
        let schedule = Schedule::DailyAt { at: hm(3, 0), tz: Tz::UTC };
        let mut state = ScheduleState::new(schedule, now, true);

        assert_eq!(state.sleep_for(now, Duration::from_secs(60)), Duration::ZERO);
        assert_eq!(state.tick(now), Action::RunNow);
        assert_eq!(state.tick(now), Action::Wait);
        assert_eq!(state.next_fire(), utc(2024, 3, 2, 3, 0, 0));
        assert_eq!(state.tick(utc(2024, 3, 2, 3, 0, 0)), Action::RunNow);
    }

    #[test]
    fn test_dst_gap_moves_to_first_valid_time() {
        // 02:30 does not exist in New York on 2024-03-10.
        let new_york: Tz = "America/New_York".parse().unwrap();
        let schedule = Schedule::DailyAt { at: hm(2, 30), tz: new_york };
        let state = ScheduleState::new(schedule, utc(2024, 3, 10, 5, 0, 0), false);
        assert_eq!(state.next_fire(), utc(2024, 3, 10, 7, 0, 0));
    }

    #[test]
    fn test_sleep_for_is_capped_by_poll_interval() {
        let now = utc(2024, 3, 1, 0, 0, 0);
        let mut state = ScheduleState::new(Schedule::Interval(Duration::from_secs(30)), now, false);
        assert_eq!(state.sleep_for(now, Duration::from_secs(60)), Duration::ZERO);

        state.tick(now);
        assert_eq!(state.sleep_for(now, Duration::from_secs(60)), Duration::from_secs(30));
        assert_eq!(state.sleep_for(now, Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_schedule_display() {
        assert_eq!(Schedule::Interval(Duration::from_secs(43_200)).to_string(), "every 43200s");
        assert_eq!(
            Schedule::calendar_from(Some("weekly"), Some("04:30"), None).to_string(),
            "weekly on Sunday at 04:30 (UTC)"
        );
    }
}
