//! Disposition: the processor's verdict for one reserved item, and the broker
//! action it resolves to.
//!
//! Resolution rules:
//! - `delete == true` always deletes, whatever the error says.
//! - Otherwise the job is released with the configured priority.
//! - A release carrying an error but no delay gets the configured error delay,
//!   so a failing job is not handed straight back.

use std::fmt;
use std::time::Duration;

use crate::config::ConsumerConfig;
use crate::error::BoxError;

/// What the processor wants done with an item.
#[derive(Default)]
pub struct Disposition {
    pub delay: Duration,
    pub delete: bool,
    pub error: Option<BoxError>,
}

impl Disposition {
    /// Remove the job permanently.
    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }

    /// Put the job back, reservable again after `delay`.
    pub fn release(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Release after a processing failure; the error delay applies.
    pub fn retry(error: impl Into<BoxError>) -> Self {
        Self::release(Duration::ZERO).with_error(error)
    }

    pub fn with_error(mut self, error: impl Into<BoxError>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn resolve(&self, config: &ConsumerConfig) -> Ack {
        if self.delete {
            return Ack::Delete;
        }
        let delay = if self.error.is_some() && self.delay.is_zero() {
            config.error_release_delay
        } else {
            self.delay
        };
        // NOTE: every release uses the configured priority; the job's own
        // priority from `put` is not carried over.
        Ack::Release {
            priority: config.release_priority,
            delay,
        }
    }
}

impl fmt::Debug for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposition")
            .field("delay", &self.delay)
            .field("delete", &self.delete)
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Broker action applied to a reserved job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Delete,
    Release { priority: u32, delay: Duration },
}
