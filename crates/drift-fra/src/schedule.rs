//! Retrieval schedules.
//!
//! A schedule entry is a set of bitmaps over second, minute, hour,
//! day-of-month, month and day-of-week. [`calc_next_time`] walks the
//! fields coarse-to-fine and produces the next instant at or after
//! `from` satisfying every constraint. Day-of-month and day-of-week
//! must both match.
//!
//! A `month` field of [`TIME_EXTERNAL`] disables evaluation for that
//! entry: an external trigger owns the directory's timing.

use std::sync::Mutex;

use chrono::{DateTime, Datelike, Local, TimeDelta, TimeZone, Timelike};

/// Sentinel in `TimeEntry::month` handing timing to an external trigger.
pub const TIME_EXTERNAL: u16 = i16::MAX as u16;

/// Iteration guard for pathological (empty) bitmaps.
const MAX_STEPS: u32 = 200_000;

/// One cron-like schedule entry, 32 bytes in the mapped record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TimeEntry {
    /// Bits 0..=59.
    pub second: u64,
    /// Bits 0..=59.
    pub minute: u64,
    /// Bits 0..=23.
    pub hour: u32,
    /// Bit `d - 1` for day `d` (1..=31).
    pub day_of_month: u32,
    /// Bits 0..=11 for January..December, or [`TIME_EXTERNAL`].
    pub month: u16,
    /// Bits 0..=6 for Monday..Sunday.
    pub day_of_week: u8,
    pub _pad: [u8; 5],
}

const _: () = assert!(std::mem::size_of::<TimeEntry>() == 32);

impl TimeEntry {
    /// Entry matching every instant (second 0 of every minute).
    pub fn every_minute() -> Self {
        Self {
            second: 1,
            minute: (1u64 << 60) - 1,
            hour: (1u32 << 24) - 1,
            day_of_month: (1u32 << 31) - 1,
            month: (1u16 << 12) - 1,
            day_of_week: (1u8 << 7) - 1,
            _pad: [0; 5],
        }
    }

    /// Entry firing at `minute` past every hour.
    pub fn hourly_at(minute: u32) -> Self {
        Self {
            minute: 1u64 << minute,
            ..Self::every_minute()
        }
    }

    /// Entry firing at `hour:minute` every day.
    pub fn daily_at(hour: u32, minute: u32) -> Self {
        Self {
            minute: 1u64 << minute,
            hour: 1u32 << hour,
            ..Self::every_minute()
        }
    }

    /// Entry deferring to an external trigger.
    pub fn external() -> Self {
        Self {
            month: TIME_EXTERNAL,
            ..Self::every_minute()
        }
    }

    pub fn is_external(&self) -> bool {
        self.month == TIME_EXTERNAL
    }
}

// chrono picks the zone up from the TZ environment variable; swapping
// it is process-global state, hence the mutex.
static TZ_LOCK: Mutex<()> = Mutex::new(());

/// Next time `>= from` matching `entry`, as a unix timestamp.
///
/// `tz` names the timezone the bitmaps are expressed in; `None`
/// evaluates in the process-local zone. Returns `None` for external
/// entries and for bitmaps nothing can satisfy.
pub fn calc_next_time(entry: &TimeEntry, tz: Option<&str>, from: i64) -> Option<i64> {
    if entry.is_external() {
        return None;
    }
    match tz {
        None => calc_local(entry, from),
        Some(name) => {
            let _guard = TZ_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            let saved = std::env::var_os("TZ");
            std::env::set_var("TZ", name);
            let out = calc_local(entry, from);
            match saved {
                Some(v) => std::env::set_var("TZ", v),
                None => std::env::remove_var("TZ"),
            }
            out
        }
    }
}

/// Minimum [`calc_next_time`] across `entries`.
pub fn calc_next_time_array(entries: &[TimeEntry], tz: Option<&str>, from: i64) -> Option<i64> {
    entries
        .iter()
        .filter_map(|e| calc_next_time(e, tz, from))
        .min()
}

fn calc_local(entry: &TimeEntry, from: i64) -> Option<i64> {
    let mut t: DateTime<Local> = Local.timestamp_opt(from, 0).single()?;

    for _ in 0..MAX_STEPS {
        if entry.month & (1 << t.month0()) == 0 {
            // Jump to the first second of the next month.
            let (y, m) = if t.month() == 12 {
                (t.year() + 1, 1)
            } else {
                (t.year(), t.month() + 1)
            };
            t = Local.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()?;
            continue;
        }
        let dom_ok = entry.day_of_month & (1 << (t.day() - 1)) != 0;
        let dow_ok = entry.day_of_week & (1 << t.weekday().num_days_from_monday()) != 0;
        if !dom_ok || !dow_ok {
            let next = t
                .date_naive()
                .succ_opt()?
                .and_hms_opt(0, 0, 0)?;
            t = Local.from_local_datetime(&next).single()?;
            continue;
        }
        if entry.hour & (1 << t.hour()) == 0 {
            t = t
                .with_minute(0)?
                .with_second(0)?
                .checked_add_signed(TimeDelta::hours(1))?;
            continue;
        }
        if entry.minute & (1 << t.minute()) == 0 {
            t = t.with_second(0)?.checked_add_signed(TimeDelta::minutes(1))?;
            continue;
        }
        if entry.second & (1 << t.second()) == 0 {
            t = t.checked_add_signed(TimeDelta::seconds(1))?;
            continue;
        }
        return Some(t.timestamp());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp()
    }

    #[test]
    fn test_every_minute_rounds_up_to_next_minute() {
        let from = ts(2024, 3, 15, 10, 30, 12);
        let next = calc_next_time(&TimeEntry::every_minute(), Some("UTC"), from).unwrap();
        assert_eq!(next, ts(2024, 3, 15, 10, 31, 0));
    }

    #[test]
    fn test_exact_hit_is_returned_unchanged() {
        let from = ts(2024, 3, 15, 10, 30, 0);
        let next = calc_next_time(&TimeEntry::every_minute(), Some("UTC"), from).unwrap();
        assert_eq!(next, from);
    }

    #[test]
    fn test_daily_schedule_crosses_midnight() {
        let entry = TimeEntry::daily_at(6, 15);
        let from = ts(2024, 3, 15, 12, 0, 0);
        let next = calc_next_time(&entry, Some("UTC"), from).unwrap();
        assert_eq!(next, ts(2024, 3, 16, 6, 15, 0));
    }

    #[test]
    fn test_day_of_week_constraint() {
        // Fire only on Mondays at 00:00. 2024-03-15 is a Friday.
        let entry = TimeEntry {
            minute: 1,
            hour: 1,
            day_of_week: 1, // Monday
            ..TimeEntry::every_minute()
        };
        let from = ts(2024, 3, 15, 1, 0, 0);
        let next = calc_next_time(&entry, Some("UTC"), from).unwrap();
        assert_eq!(next, ts(2024, 3, 18, 0, 0, 0));
    }

    #[test]
    fn test_month_constraint_jumps_months() {
        // Only December, any day, 00:00:00.
        let entry = TimeEntry {
            minute: 1,
            hour: 1,
            month: 1 << 11,
            ..TimeEntry::every_minute()
        };
        let from = ts(2024, 3, 15, 0, 0, 0);
        let next = calc_next_time(&entry, Some("UTC"), from).unwrap();
        assert_eq!(next, ts(2024, 12, 1, 0, 0, 0));
    }

    #[test]
    fn test_external_entry_yields_nothing() {
        assert_eq!(
            calc_next_time(&TimeEntry::external(), Some("UTC"), 0),
            None
        );
    }

    #[test]
    fn test_empty_bitmap_terminates() {
        let entry = TimeEntry {
            hour: 0,
            ..TimeEntry::every_minute()
        };
        assert_eq!(calc_next_time(&entry, Some("UTC"), 0), None);
    }

    #[test]
    fn test_array_takes_minimum() {
        let from = ts(2024, 3, 15, 10, 0, 1);
        let entries = [TimeEntry::daily_at(23, 0), TimeEntry::hourly_at(30)];
        let next = calc_next_time_array(&entries, Some("UTC"), from).unwrap();
        assert_eq!(next, ts(2024, 3, 15, 10, 30, 0));
    }

    #[test]
    fn test_timezone_shifts_the_result() {
        // 05:00 daily: in a UTC+3 zone the unix timestamp is 3 h earlier
        // than the UTC evaluation of the same bitmaps.
        if !std::path::Path::new("/usr/share/zoneinfo/Etc/GMT-3").exists() {
            return; // no tz database on this host
        }
        let entry = TimeEntry::daily_at(5, 0);
        let from = ts(2024, 6, 1, 0, 0, 0);
        let utc = calc_next_time(&entry, Some("UTC"), from).unwrap();
        let shifted = calc_next_time(&entry, Some("Etc/GMT-3"), from).unwrap();
        assert_eq!(utc - shifted, 3 * 3600);
    }
}
