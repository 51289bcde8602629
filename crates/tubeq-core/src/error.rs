use thiserror::Error;

use crate::domain::JobId;

/// Boxed error returned by caller-supplied processing logic.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    #[error("broker connection closed")]
    ConnectionClosed,

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors that end a `subscribe` call.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The dispatch task stopped without reporting a broker error
    /// (it panicked, or was dropped by the runtime).
    #[error("dispatch loop terminated unexpectedly")]
    DispatchTerminated,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
