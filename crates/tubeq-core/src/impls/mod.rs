//! Impls - in-process implementations of the ports.
//!
//! - **InMemoryBroker**: a beanstalk-like broker for development and tests

pub mod inmem_broker;

pub use self::inmem_broker::{
    BrokerOp, DEFAULT_OP_LOG_CAPACITY, InMemoryBroker, InMemoryConnection, JobStatus,
};
