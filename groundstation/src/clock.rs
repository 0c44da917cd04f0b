//! Time APIs for obtaining the current UTC time and pacing the control loop.
//!
//! Pass scheduling runs against ephemeris predictions, so unlike a link-layer
//! tick counter this clock speaks wall-clock UTC. Sleeping goes through the
//! same trait so every wait in the station (the 0.5 s loop tick, radio
//! response polls, uplink listen windows) can be driven by a mock in tests.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Converts a std duration into the chrono representation used for deadline
/// arithmetic against `DateTime<Utc>` values.
///
/// Panics if `duration` exceeds the chrono range, which no station interval
/// comes near.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).expect("duration out of range")
}

/// Trait for time providers.
///
/// The platform has to provide an implementation of `Clock` to the station.
/// The returned times must never move backwards.
///
/// This trait can also be implemented by a mock clock for testing; see
/// [`MockClock`].
///
/// [`MockClock`]: struct.MockClock.html
pub trait Clock {
    /// Obtain the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspends the calling thread for at least `duration`.
    fn sleep(&self, duration: Duration);
}

/// The process wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// A settable clock whose `sleep` advances simulated time instead of blocking.
///
/// Cloning yields a handle onto the same underlying time, so a test can hold
/// one handle while the code under test holds another. Polling loops that
/// sleep between checks terminate promptly under this clock because every
/// sleep moves the deadline closer.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Creates a mock clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Creates a mock clock starting at an arbitrary fixed epoch.
    pub fn fixed() -> Self {
        Self::new(Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap())
    }

    /// Moves the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + chrono::Duration::from_std(duration).unwrap();
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap() = at;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
