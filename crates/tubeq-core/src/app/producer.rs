//! Producer - enqueue work.
//!
//! Each call dials, puts one job, and closes the connection again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Span;

use crate::domain::JobId;
use crate::error::BrokerError;
use crate::ports::{Clock, Dialer, SystemClock};

pub struct Producer {
    dialer: Arc<dyn Dialer>,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl Producer {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            clock: Arc::new(SystemClock),
            span: Span::none(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Put `body` on `tube`; it becomes reservable after `delay`.
    pub async fn put(
        &self,
        addr: &str,
        body: &[u8],
        tube: &str,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, BrokerError> {
        let mut conn = self.dialer.dial(addr).await?;
        let result = conn.put(tube, body, priority, delay, ttr).await;
        if let Err(e) = conn.close().await {
            tracing::error!(parent: &self.span, error = %e, "close broker connection");
        }
        if let Ok(id) = &result {
            tracing::debug!(parent: &self.span, %id, tube, ?delay, "put job");
        }
        result
    }

    /// Put `body` on `tube` so that it becomes reservable at `at`.
    /// A time in the past means "now".
    pub async fn put_at(
        &self,
        addr: &str,
        body: &[u8],
        tube: &str,
        priority: u32,
        at: DateTime<Utc>,
        ttr: Duration,
    ) -> Result<JobId, BrokerError> {
        let delay = delay_until(self.clock.now(), at);
        self.put(addr, body, tube, priority, delay, ttr).await
    }
}

/// `max(0, at - now)`.
pub fn delay_until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{BrokerOp, InMemoryBroker, JobStatus};
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    const ADDR: &str = "mem://local";
    const TTR: Duration = Duration::from_secs(60);

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn producer(broker: &InMemoryBroker) -> Producer {
        Producer::new(Arc::new(broker.clone())).with_clock(Arc::new(FixedClock::new(noon())))
    }

    #[test]
    fn delay_until_clamps_past_times_to_zero() {
        let now = noon();
        assert_eq!(delay_until(now, now), Duration::ZERO);
        assert_eq!(
            delay_until(now, now - chrono::Duration::minutes(5)),
            Duration::ZERO
        );
        assert_eq!(
            delay_until(now, now + chrono::Duration::seconds(90)),
            Duration::from_secs(90)
        );
    }

    #[tokio::test]
    async fn put_enqueues_and_closes_connection() {
        let broker = InMemoryBroker::new();
        let id = producer(&broker)
            .put(ADDR, b"hello", "emails", 7, Duration::ZERO, TTR)
            .await
            .unwrap();
        assert_eq!(id, JobId::new(1));
        assert_eq!(broker.job_status(id), Some(JobStatus::Ready));
        assert_eq!(broker.job_priority(id), Some(7));
    }

    #[tokio::test]
    async fn put_at_in_the_past_uses_zero_delay() {
        let broker = InMemoryBroker::new();
        let id = producer(&broker)
            .put_at(ADDR, b"late", "emails", 1, noon() - chrono::Duration::hours(1), TTR)
            .await
            .unwrap();
        assert_eq!(
            broker.ops(),
            vec![BrokerOp::Put {
                id,
                tube: "emails".to_string(),
                priority: 1,
                delay: Duration::ZERO
            }]
        );
        assert_eq!(broker.job_status(id), Some(JobStatus::Ready));
    }

    #[tokio::test]
    async fn put_at_in_the_future_delays_by_difference() {
        let broker = InMemoryBroker::new();
        let id = producer(&broker)
            .put_at(ADDR, b"soon", "emails", 1, noon() + chrono::Duration::seconds(45), TTR)
            .await
            .unwrap();
        assert!(matches!(
            broker.ops().as_slice(),
            [BrokerOp::Put { delay, .. }] if *delay == Duration::from_secs(45)
        ));
        assert_eq!(broker.job_status(id), Some(JobStatus::Delayed));
    }

    #[tokio::test]
    async fn put_with_oversized_delay_parks_job() {
        let broker = InMemoryBroker::new();
        let id = producer(&broker)
            .put(ADDR, b"x", "emails", 1, Duration::from_secs(u64::MAX), TTR)
            .await
            .unwrap();
        assert_eq!(broker.job_status(id), Some(JobStatus::Delayed));
    }

    #[tokio::test]
    async fn put_at_far_future_parks_job() {
        let broker = InMemoryBroker::new();
        let at = DateTime::<Utc>::MAX_UTC;
        let id = producer(&broker)
            .put_at(ADDR, b"x", "emails", 1, at, TTR)
            .await
            .unwrap();
        assert_eq!(broker.job_status(id), Some(JobStatus::Delayed));
    }

    #[tokio::test]
    async fn dial_error_is_returned() {
        let broker = InMemoryBroker::new();
        broker.shutdown();
        let err = producer(&broker)
            .put(ADDR, b"x", "emails", 1, Duration::ZERO, TTR)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Dial { .. }));
    }
}
