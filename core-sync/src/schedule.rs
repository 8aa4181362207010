//! Timing helpers for scheduled runs and retries.

use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use std::time::Duration;

/// Time left until the next occurrence of `time` of day after `now`.
///
/// When `now` is exactly at `time` the next run is a full day away.
pub fn delay_until_next(time: NaiveTime, now: NaiveDateTime) -> Duration {
    let today = now.date().and_time(time);
    let next = if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or_default()
}

/// Exponential backoff `initial * 2^attempt`, capped at `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    initial.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_delay_later_today() {
        let time = NaiveTime::from_hms_opt(3, 30, 0).unwrap();
        assert_eq!(delay_until_next(time, at(1, 0)), Duration::from_secs(150 * 60));
    }

    #[test]
    fn test_delay_rolls_over_to_tomorrow() {
        let time = NaiveTime::from_hms_opt(3, 30, 0).unwrap();
        assert_eq!(
            delay_until_next(time, at(4, 30)),
            Duration::from_secs(23 * 3600)
        );
        assert_eq!(
            delay_until_next(time, at(3, 30)),
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let initial = Duration::from_secs(30);
        let max = Duration::from_secs(600);

        assert_eq!(backoff_delay(initial, max, 0), Duration::from_secs(30));
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_secs(60));
        assert_eq!(backoff_delay(initial, max, 3), Duration::from_secs(240));
        assert_eq!(backoff_delay(initial, max, 5), max);
        assert_eq!(backoff_delay(initial, max, 40), max);
    }
}
