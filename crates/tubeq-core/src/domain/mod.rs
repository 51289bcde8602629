//! Domain model: job ids, reserved items, processing verdicts.

pub mod disposition;
pub mod ids;
pub mod item;

pub use disposition::{Ack, Disposition};
pub use ids::JobId;
pub use item::Item;
