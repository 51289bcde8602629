//! Ports: the seams to the outside world.
//!
//! - `broker`: a work-queue broker reachable by address (dial, put, reserve, ...)
//! - `clock`: wall-clock time, swappable in tests

pub mod broker;
pub mod clock;

pub use self::broker::{Connection, DEFAULT_TUBE, Dialer, Reservation};
pub use self::clock::{Clock, FixedClock, SystemClock};
