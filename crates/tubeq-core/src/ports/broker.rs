//! Broker port - work-queue broker (beanstalkd style tubes).
//!
//! A `Dialer` opens connections by address; a `Connection` is owned by exactly
//! one user at a time (`&mut self` everywhere), so it is `Send` but not `Sync`.
//!
//! # Reserve outcomes
//! `reserve` returns a `Reservation` instead of a `Result` so callers can
//! tell "nothing arrived within the timeout" from a broken connection without
//! looking at error text.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Item, JobId};
use crate::error::BrokerError;

/// Tube every new connection watches and uses until told otherwise.
pub const DEFAULT_TUBE: &str = "default";

/// Result of one reserve call.
#[derive(Debug)]
pub enum Reservation {
    /// No job became available within the timeout.
    Timeout,
    /// A job was reserved for this connection.
    Delivered(Item),
    /// The connection or the protocol failed; the connection is unusable.
    Fatal(BrokerError),
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send {
    /// Enqueue `body` on `tube`. Returns the id assigned by the broker.
    async fn put(
        &mut self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, BrokerError>;

    /// Add `tube` to the watch list. Returns the number of watched tubes.
    async fn watch(&mut self, tube: &str) -> Result<usize, BrokerError>;

    /// Remove `tube` from the watch list. Returns the number of watched tubes.
    async fn ignore(&mut self, tube: &str) -> Result<usize, BrokerError>;

    /// Reserve the next ready job from any watched tube, waiting up to `timeout`.
    async fn reserve(&mut self, timeout: Duration) -> Reservation;

    async fn delete(&mut self, id: JobId) -> Result<(), BrokerError>;

    async fn release(&mut self, id: JobId, priority: u32, delay: Duration)
        -> Result<(), BrokerError>;

    /// Close the connection. Jobs still reserved by it return to the broker.
    async fn close(&mut self) -> Result<(), BrokerError>;
}
