//! App - ports wired into consumer and producer behaviour.
//!
//! # Components
//! - **Subscriber**: dial, watch a tube, feed reserved items to a `Processor`
//! - **Producer**: one-shot `put` / `put_at`
//! - **dispatch**: the per-connection reserve loop behind a subscription

pub(crate) mod dispatch;
pub mod producer;
pub mod subscription;

pub use self::producer::{Producer, delay_until};
pub use self::subscription::{ProcessFn, Processor, Subscriber, processor_fn};
