//! Broker job identifiers.
//!
//! # Broker-assigned ids
//! Ids come from the broker on `put` (monotonic, starting at 1 per broker);
//! the client never generates one.
//!
//! ## Newtype
//! - a job id cannot be confused with a priority, a delay or a count
//! - serialises as the bare number (`#[serde(transparent)]`)
//! - `Display` prints the bare number, which is what log `id` fields carry

use serde::{Deserialize, Serialize};
use std::fmt;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_serializes_as_bare_number() {
        let id = JobId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn job_ids_order_by_value() {
        assert!(JobId::new(1) < JobId::new(2));
        assert_eq!(JobId::from(7).get(), 7);
    }
}
