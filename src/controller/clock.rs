//! Time source for phase timestamps and log lines
//!
//! Production code uses `SystemClock`; tests pin time with `MockClock` so
//! stored timestamps and rendered log lines are deterministic.

use chrono::{DateTime, SecondsFormat, Utc};

/// Source of the current time
///
/// Injected through `Context` so tests control what gets stored.
pub trait Clock: Send + Sync {
    /// Current instant in UTC
    fn now(&self) -> DateTime<Utc>;

    /// Timestamp prefix of a phase log line (RFC 3339, second precision)
    fn stamp(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Production clock backed by `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to
#[cfg(test)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    /// Create a clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Fixed instant used by most tests: 2024-05-01T12:00:00Z
    pub fn fixed() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
        )
    }

    /// Move the clock forward by `duration`
    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
