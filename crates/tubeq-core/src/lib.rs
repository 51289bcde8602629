//! tubeq-core
//!
//! Consume and produce jobs on a beanstalk-style work queue.
//!
//! # Modules
//! - **domain**: job ids, reserved items, dispositions
//! - **ports**: broker and clock abstractions
//! - **app**: subscription, producer, dispatch loop
//! - **impls**: in-memory broker
//! - **supervisor**: panic-isolated task runner
//! - **config** / **error**

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use app::{Producer, Processor, Subscriber, processor_fn};
pub use config::ConsumerConfig;
pub use domain::{Disposition, Item, JobId};
pub use error::{BoxError, BrokerError, ConfigError, SubscribeError};
