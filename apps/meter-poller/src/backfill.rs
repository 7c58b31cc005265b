//! Historical backfill of closed periods.
//!
//! The window runs from the first day of the current month up to today's
//! midnight, both in the observation timezone. Today is never included
//! since its periods are still open.

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::client::MeterClient;
use crate::error::BackfillError;
use crate::model::{EntryMetadata, HistoricalLogEntry, PeriodReading};
use crate::time::{start_of_day, start_of_month};

/// Source rows are stamped at the start of their period; log entries one hour later.
const PERIOD_SHIFT_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillWindow {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

pub fn backfill_window<Tz: TimeZone>(now: &DateTime<Tz>) -> Result<BackfillWindow, String> {
    let start = start_of_month(now)?.with_timezone(&Utc);
    let end = start_of_day(now)?.with_timezone(&Utc);
    Ok(BackfillWindow { start, end })
}

/// Converts raw readings into log entries, ascending by `period_start`.
///
/// Readings stamped outside the window are dropped.
pub fn to_log_entries(
    window: &BackfillWindow,
    readings: Vec<PeriodReading>,
) -> Vec<HistoricalLogEntry> {
    let total = readings.len();
    let mut entries: Vec<HistoricalLogEntry> = readings
        .into_iter()
        .filter(|reading| window.contains(reading.timestamp))
        .map(|reading| HistoricalLogEntry {
            period_start: reading.timestamp + Duration::seconds(PERIOD_SHIFT_SECONDS),
            value: reading.value,
            metadata: EntryMetadata {
                last_reset: reading.timestamp,
            },
        })
        .collect();

    let dropped = total - entries.len();
    if dropped > 0 {
        tracing::warn!(
            dropped,
            start = %window.start,
            end = %window.end,
            "ignoring readings outside backfill window"
        );
    }

    entries.sort_by_key(|entry| entry.period_start);
    entries
}

/// Fetches and converts the closed periods of the current month.
///
/// Any fetch error fails the whole call; nothing partial is returned.
pub async fn reconcile_history<Tz: TimeZone>(
    client: &dyn MeterClient,
    now: &DateTime<Tz>,
) -> Result<Vec<HistoricalLogEntry>, BackfillError> {
    let window = backfill_window(now).map_err(BackfillError::Window)?;
    if window.is_empty() {
        tracing::debug!(start = %window.start, "no closed periods in current month yet");
        return Ok(Vec::new());
    }

    let readings = client
        .fetch_period_readings(window.start, window.end)
        .await?;
    Ok(to_log_entries(&window, readings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeMeterClient;
    use chrono::Timelike;

    fn hourly(start: DateTime<Utc>, hours: i64) -> Vec<PeriodReading> {
        (0..hours)
            .map(|h| PeriodReading {
                timestamp: start + Duration::hours(h),
                value: 0.1 * (h + 1) as f64,
            })
            .collect()
    }

    #[test]
    fn window_spans_month_start_to_today_midnight() {
        let tz = chrono_tz::Europe::Madrid;
        let now = tz.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();
        let window = backfill_window(&now).unwrap();
        assert_eq!(
            window.start,
            tz.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(window.end, tz.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap());
    }

    #[test]
    fn shifted_entries_fall_in_start_exclusive_end_inclusive_range() {
        let window = BackfillWindow {
            start: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        };
        let readings = hourly(window.start, 24);
        let entries = to_log_entries(&window, readings.clone());

        assert_eq!(entries.len(), 24);
        for (entry, reading) in entries.iter().zip(&readings) {
            assert_eq!(entry.period_start - reading.timestamp, Duration::hours(1));
            assert_eq!(entry.metadata.last_reset, reading.timestamp);
            assert_eq!(entry.value, reading.value);
            assert!(window.contains(entry.metadata.last_reset));
            assert!(entry.period_start > window.start && entry.period_start <= window.end);
        }
        assert_eq!(entries.last().unwrap().period_start, window.end);
    }

    #[test]
    fn readings_outside_window_are_dropped_and_output_sorted() {
        let window = BackfillWindow {
            start: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 5, 3, 0, 0, 0).unwrap(),
        };
        let mut readings = hourly(window.start - Duration::hours(2), 4);
        readings.extend(hourly(window.end - Duration::hours(1), 3));
        readings.reverse();

        let entries = to_log_entries(&window, readings);
        let resets: Vec<u32> = entries
            .iter()
            .map(|entry| entry.metadata.last_reset.hour())
            .collect();
        assert_eq!(resets, vec![0, 1, 23]);
        assert!(entries
            .windows(2)
            .all(|pair| pair[0].period_start < pair[1].period_start));
    }

    #[tokio::test]
    async fn reconcile_requests_window_and_is_idempotent() {
        let tz = chrono_tz::Europe::Madrid;
        let now = tz.with_ymd_and_hms(2024, 5, 3, 15, 0, 0).unwrap();
        let window = backfill_window(&now).unwrap();
        let readings = hourly(window.start, 48);

        let client = FakeMeterClient::default();
        client.push_periods(Ok(readings.clone()));
        client.push_periods(Ok(readings));

        let first = reconcile_history(&client, &now).await.unwrap();
        let second = reconcile_history(&client, &now).await.unwrap();
        assert_eq!(first.len(), 48);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        let requests = client.period_requests.lock().unwrap().clone();
        assert_eq!(requests, vec![(window.start, window.end); 2]);
    }

    #[tokio::test]
    async fn first_day_of_month_skips_fetch() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let client = FakeMeterClient::default();
        let entries = reconcile_history(&client, &now).await.unwrap();
        assert!(entries.is_empty());
        assert!(client.period_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_error_yields_no_entries() {
        let now = Utc.with_ymd_and_hms(2024, 6, 9, 8, 0, 0).unwrap();
        let client = FakeMeterClient::default();
        client.push_periods(Err("upstream unavailable".to_string()));
        let result = reconcile_history(&client, &now).await;
        assert!(matches!(result, Err(BackfillError::Fetch(_))));
    }
}
