//! Next-occurrence arithmetic for repeating messages.
//!
//! Each step advances from the previous scheduled time, not from the
//! actual send time, so a delayed poll cycle does not drift the
//! cadence.

use chrono::{DateTime, Duration, Months, Utc};

use super::types::RecurrenceRule;

/// Computes the occurrence after `previous`, or `None` when the rule
/// does not repeat or its cutoff has passed.
///
/// Monthly steps use calendar months and clamp to the last day of
/// shorter months (Jan 31 advances to Feb 28, or Feb 29 in a leap
/// year). The time of day is preserved by every rule.
pub(crate) fn next_occurrence(
    previous: DateTime<Utc>,
    rule: &RecurrenceRule,
) -> Option<DateTime<Utc>> {
    let (candidate, end_date) = match rule {
        RecurrenceRule::None => return None,
        RecurrenceRule::Daily => (previous + Duration::days(1), None),
        RecurrenceRule::Weekly => (previous + Duration::days(7), None),
        RecurrenceRule::Monthly => (previous.checked_add_months(Months::new(1))?, None),
        RecurrenceRule::Custom(interval) => (
            previous + Duration::days(interval.interval_days),
            interval.end_date,
        ),
    };
    match end_date {
        Some(end) if candidate > end => None,
        _ => Some(candidate),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::scheduler::types::CustomInterval;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn one_shot_never_repeats() {
        assert_eq!(
            next_occurrence(utc(2025, 6, 1, 9, 0), &RecurrenceRule::None),
            None
        );
    }

    #[test]
    fn daily_and_weekly_preserve_time_of_day() {
        let previous = utc(2025, 6, 1, 9, 30);
        assert_eq!(
            next_occurrence(previous, &RecurrenceRule::Daily),
            Some(utc(2025, 6, 2, 9, 30))
        );
        assert_eq!(
            next_occurrence(previous, &RecurrenceRule::Weekly),
            Some(utc(2025, 6, 8, 9, 30))
        );
    }

    #[test]
    fn monthly_clamps_to_short_months() {
        assert_eq!(
            next_occurrence(utc(2025, 1, 31, 8, 0), &RecurrenceRule::Monthly),
            Some(utc(2025, 2, 28, 8, 0))
        );
        assert_eq!(
            next_occurrence(utc(2024, 1, 31, 8, 0), &RecurrenceRule::Monthly),
            Some(utc(2024, 2, 29, 8, 0))
        );
        assert_eq!(
            next_occurrence(utc(2025, 3, 15, 8, 0), &RecurrenceRule::Monthly),
            Some(utc(2025, 4, 15, 8, 0))
        );
    }

    #[test]
    fn custom_interval_steps_by_days() {
        let rule = RecurrenceRule::Custom(CustomInterval {
            interval_days: 3,
            end_date: None,
        });
        assert_eq!(
            next_occurrence(utc(2025, 6, 1, 12, 0), &rule),
            Some(utc(2025, 6, 4, 12, 0))
        );
    }

    #[test]
    fn custom_interval_stops_past_end_date() {
        let rule = RecurrenceRule::Custom(CustomInterval {
            interval_days: 7,
            end_date: Some(utc(2025, 6, 10, 0, 0)),
        });
        assert_eq!(
            next_occurrence(utc(2025, 6, 1, 0, 0), &rule),
            Some(utc(2025, 6, 8, 0, 0))
        );
        assert_eq!(next_occurrence(utc(2025, 6, 8, 0, 0), &rule), None);
    }
}
