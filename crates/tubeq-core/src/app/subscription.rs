//! Subscriber - consumer-facing loop.
//!
//! `subscribe` dials, watches the tube, starts a dispatch loop on a supervised
//! task, then processes delivered items one at a time until the session
//! reports a fatal broker error.
//!
//! # Flow
//! ```text
//! dial ─► watch tube / ignore "default" ─► spawn dispatch loop
//!                                             │
//!   ┌──── select (fatal first) ◄──────────────┘
//!   ├─ fatal slot  ─► return Err
//!   └─ item queue  ─► processor.process ─► ack(disposition) ─┐
//!         ▲                                                   │
//!         └───────────────────────────────────────────────────┘
//! ```
//!
//! # Rules
//! - one item at a time; the next one is not reserved until the ack is sent
//! - processing errors are logged with the item id and never end the loop
//! - a dispatch loop that dies without reporting ends the call with
//!   [`SubscribeError::DispatchTerminated`]

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{Instrument, Span};

use super::dispatch::{self, Delivery};
use crate::config::ConsumerConfig;
use crate::domain::{Disposition, Item};
use crate::error::{BrokerError, SubscribeError};
use crate::ports::{Connection, DEFAULT_TUBE, Dialer};
use crate::supervisor;

/// Caller logic applied to each reserved item.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, item: &Item) -> Disposition;
}

/// Adapter returned by [`processor_fn`].
pub struct ProcessFn<F>(F);

/// Use a closure as a [`Processor`]. The closure gets its own copy of the item.
pub fn processor_fn<F, Fut>(f: F) -> ProcessFn<F>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Disposition> + Send,
{
    ProcessFn(f)
}

#[async_trait]
impl<F, Fut> Processor for ProcessFn<F>
where
    F: Fn(Item) -> Fut + Send + Sync,
    Fut: Future<Output = Disposition> + Send,
{
    async fn process(&self, item: &Item) -> Disposition {
        (self.0)(item.clone()).await
    }
}

pub struct Subscriber {
    dialer: Arc<dyn Dialer>,
    config: ConsumerConfig,
    span: Span,
}

impl Subscriber {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            config: ConsumerConfig::default(),
            span: Span::none(),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Parent span for everything this subscriber logs.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume `tube` at `addr` until the broker connection fails.
    ///
    /// Never returns `Ok`. `tag` only labels log output.
    pub async fn subscribe<P>(
        &self,
        addr: &str,
        tube: &str,
        tag: &str,
        processor: &P,
    ) -> Result<Infallible, SubscribeError>
    where
        P: Processor + ?Sized,
    {
        let span = tracing::info_span!(parent: &self.span, "subscription", tag, tube, addr);
        self.run(addr, tube, processor).instrument(span).await
    }

    async fn run<P>(
        &self,
        addr: &str,
        tube: &str,
        processor: &P,
    ) -> Result<Infallible, SubscribeError>
    where
        P: Processor + ?Sized,
    {
        let mut conn = self.dialer.dial(addr).await?;
        if let Err(e) = watch_only(conn.as_mut(), tube).await {
            tracing::error!(error = %e, "watch tube");
            if let Err(e) = conn.close().await {
                tracing::error!(error = %e, "close broker connection");
            }
            return Err(e.into());
        }

        let (dispatch, mut session) = dispatch::session(conn, self.config.clone());
        let _dispatch = supervisor::spawn_once(Span::current(), dispatch.run());

        loop {
            tokio::select! {
                biased;
                fatal = &mut session.fatal => return Err(terminated(fatal)),
                delivery = session.items.recv() => match delivery {
                    Some(delivery) => process(processor, delivery).await,
                    // dispatch ended; its error (if any) is already in the fatal slot
                    None => return Err(terminated((&mut session.fatal).await)),
                },
            }
        }
    }
}

async fn watch_only(conn: &mut dyn Connection, tube: &str) -> Result<(), BrokerError> {
    conn.watch(tube).await?;
    if tube != DEFAULT_TUBE {
        conn.ignore(DEFAULT_TUBE).await?;
    }
    Ok(())
}

fn terminated(fatal: Result<BrokerError, oneshot::error::RecvError>) -> SubscribeError {
    match fatal {
        Ok(e) => SubscribeError::Broker(e),
        Err(_) => SubscribeError::DispatchTerminated,
    }
}

async fn process<P>(processor: &P, delivery: Delivery)
where
    P: Processor + ?Sized,
{
    let Delivery { item, ack } = delivery;
    let id = item.id();
    let disposition = processor.process(&item).await;
    if let Some(e) = &disposition.error {
        tracing::error!(%id, error = %e, "process item failed");
    }
    if ack.send(disposition).is_err() {
        tracing::warn!(%id, "dispatch loop gone before acknowledgment");
    }
}
