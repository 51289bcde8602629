//! Clock port - wall-clock time
//!
//! # Implementations
//! - **SystemClock**: production, reads `Utc::now()`
//! - **FixedClock**: tests, always returns the instant it was built with
//!
//! # Testability
//! `Producer::put_at` turns an absolute time into a delay against this clock,
//! so a pinned clock makes the resulting delay exact.

use chrono::{DateTime, Utc};

/// Clock provides the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that always returns the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    at: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { at }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.at
    }
}
