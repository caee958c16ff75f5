use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Bound on exclusion-skipping iterations. A calendar that excludes more
/// than a year of consecutive time is treated as misconfigured.
const MAX_SKIP_STEPS: usize = 400;

/// A named exclusion schedule. Triggers referencing a calendar skip fire
/// times that land inside an excluded window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Calendar {
    /// Excludes whole ISO weekdays (0 = Monday … 6 = Sunday).
    WeeklyDays { excluded_days: Vec<u8> },

    /// Excludes the daily wall-clock window `[start_minute, end_minute)`
    /// UTC, where minutes count from midnight.
    DailyWindow { start_minute: u16, end_minute: u16 },

    /// Excludes explicit absolute ranges `[start_ms, end_ms)`.
    Ranges { ranges: Vec<(i64, i64)> },
}

impl Calendar {
    /// Whether `ts_ms` is a permitted fire time under this calendar.
    pub fn is_time_included(&self, ts_ms: i64) -> bool {
        match self {
            Calendar::WeeklyDays { excluded_days } => {
                let dow = utc(ts_ms).weekday().num_days_from_monday() as u8;
                !excluded_days.contains(&dow)
            }
            Calendar::DailyWindow {
                start_minute,
                end_minute,
            } => {
                let t = utc(ts_ms);
                let minute_of_day = (t.hour() * 60 + t.minute()) as u16;
                !(minute_of_day >= *start_minute && minute_of_day < *end_minute)
            }
            Calendar::Ranges { ranges } => !ranges
                .iter()
                .any(|(start, end)| ts_ms >= *start && ts_ms < *end),
        }
    }

    /// First permitted instant at or after `ts_ms`.
    ///
    /// Returns `ts_ms` unchanged when the calendar never re-admits time
    /// within [`MAX_SKIP_STEPS`] jumps (a misconfigured calendar).
    pub fn next_included_time(&self, ts_ms: i64) -> i64 {
        let mut t = ts_ms;
        for _ in 0..MAX_SKIP_STEPS {
            if self.is_time_included(t) {
                return t;
            }
            t = self.skip_forward(t);
        }
        warn!("calendar excludes all reachable time; ignoring exclusion");
        ts_ms
    }

    /// Jump just past the exclusion containing `ts_ms`.
    fn skip_forward(&self, ts_ms: i64) -> i64 {
        match self {
            Calendar::WeeklyDays { .. } => {
                // Start of the next UTC day.
                let next_day = utc(ts_ms).date_naive() + Duration::days(1);
                Utc.from_utc_datetime(&next_day.and_hms_opt(0, 0, 0).unwrap())
                    .timestamp_millis()
            }
            Calendar::DailyWindow { end_minute, .. } => {
                let t = utc(ts_ms);
                let day_start = Utc
                    .from_utc_datetime(&t.date_naive().and_hms_opt(0, 0, 0).unwrap())
                    .timestamp_millis();
                day_start + (*end_minute as i64) * 60_000
            }
            Calendar::Ranges { ranges } => ranges
                .iter()
                .find(|(start, end)| ts_ms >= *start && ts_ms < *end)
                .map(|(_, end)| *end)
                .unwrap_or(ts_ms + 1),
        }
    }
}

fn utc(ts_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Utc::now)
}
