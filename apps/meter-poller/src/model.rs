use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const UNIT_KWH: &str = "kWh";

/// Live accumulated reading. Both fields are absent until the first restore or poll.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObservedValue {
    pub value: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
}

impl ObservedValue {
    pub fn new(value: f64, observed_at: DateTime<Utc>) -> Self {
        Self {
            value: Some(value),
            observed_at: Some(observed_at),
        }
    }

    /// Replaces the current value unless the reading is older than what is already held.
    pub fn apply(&mut self, reading: &CurrentReading) -> bool {
        if let Some(current) = self.observed_at {
            if reading.observed_at < current {
                return false;
            }
        }
        self.value = Some(reading.value);
        self.observed_at = Some(reading.observed_at);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentReading {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// Raw per-period value as reported by the meter, stamped at the period's start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodReading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub last_reset: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalLogEntry {
    pub period_start: DateTime<Utc>,
    pub value: f64,
    pub metadata: EntryMetadata,
}

/// Last persisted state as read back from storage. The value is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoredState {
    pub value: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDetails {
    pub serial: String,
    pub manufacturer: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn apply_rejects_readings_older_than_current() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let mut observed = ObservedValue::new(100.0, t0);

        let stale = CurrentReading {
            value: 90.0,
            observed_at: t0 - Duration::minutes(5),
        };
        assert!(!observed.apply(&stale));
        assert_eq!(observed.value, Some(100.0));
        assert_eq!(observed.observed_at, Some(t0));

        let fresh = CurrentReading {
            value: 101.5,
            observed_at: t0 + Duration::hours(1),
        };
        assert!(observed.apply(&fresh));
        assert_eq!(observed.value, Some(101.5));
    }

    #[test]
    fn apply_on_empty_value_always_succeeds() {
        let mut observed = ObservedValue::default();
        let reading = CurrentReading {
            value: 3.25,
            observed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        assert!(observed.apply(&reading));
        assert_eq!(observed.value, Some(3.25));
    }
}
