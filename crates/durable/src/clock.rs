//! Durable clock
//!
//! Workflow code never samples wall-clock time. The executor stamps every history
//! event with `clock.now()` when it is appended, and replayed callbacks see that
//! recorded instant. Swapping in a [`ManualClock`] makes timer behaviour fully
//! deterministic in tests.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Source of "now" for the substrate
pub trait DurableClock: Send + Sync + 'static {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl DurableClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use warden_durable::{DurableClock, ManualClock};
///
/// let clock = ManualClock::at("2024-05-01T12:00:00Z".parse().unwrap());
/// clock.advance(Duration::from_secs(60));
/// assert_eq!(clock.now().to_rfc3339(), "2024-05-01T12:01:00+00:00");
/// ```
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `instant`
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(instant),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.write();
        *now += delta;
    }

    /// Jump to an absolute instant (may move backwards; tests only)
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.write() = instant;
    }
}

impl DurableClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let start: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let clock = ManualClock::at(start);

        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(3600));
        assert_eq!(clock.now(), start + chrono::Duration::hours(1));
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::at("2024-01-01T00:00:00Z".parse().unwrap());
        let later: DateTime<Utc> = "2024-06-01T09:00:00Z".parse().unwrap();
        clock.set(later);
        assert_eq!(clock.now(), later);
    }
}
