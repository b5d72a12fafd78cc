//! Wall-clock source for the sync engine
//!
//! Timestamps are kept at microsecond precision so they survive a round
//! trip through storage unchanged.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Timelike, Utc};

use super::error::{SyncError, SyncResult};

/// Source of "now"
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_to_micros(Utc::now())
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = by.num_microseconds().unwrap_or(i64::MAX);
        self.micros.fetch_add(step, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::SeqCst);
        Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
    }
}

fn truncate_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = (at.nanosecond() / 1_000) * 1_000;
    at.with_nanosecond(nanos).unwrap_or(at)
}

/// Fixed-width RFC 3339 form used in storage; lexical order is time order
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Corrupt(format!("bad timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip_and_order() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
        let first = clock.now();
        clock.advance(Duration::microseconds(1));
        let second = clock.now();

        let a = format_timestamp(first);
        let b = format_timestamp(second);
        assert!(a < b);
        assert_eq!(a, "2026-03-01T09:00:00.000000Z");
        assert_eq!(parse_timestamp(&b).unwrap(), second);
    }

    #[test]
    fn test_system_clock_is_micro_precise() {
        let now = SystemClock.now();
        assert_eq!(now.nanosecond() % 1_000, 0);
        assert_eq!(parse_timestamp(&format_timestamp(now)).unwrap(), now);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_timestamp("yesterday"), Err(SyncError::Corrupt(_))));
    }
}
