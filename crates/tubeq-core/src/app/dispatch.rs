//! DispatchLoop - reserve → hand off → wait for ack → delete/release
//!
//! The loop owns its broker connection for the whole session. Items go to the
//! subscriber through a capacity-1 queue, each paired with a one-shot ack that
//! carries the processor's `Disposition` back. The loop applies it on its own
//! connection and only then reserves again, so at most one item is in flight
//! and every delivered item gets exactly one delete or release.
//!
//! ```text
//! reserve ──► Delivered ──► items.send ──► ack.await ──► delete | release ─┐
//!    ▲   └──► Timeout ─────────────────────────────────────────────────────┤
//!    └─────────────────────────────────────────────────────────────────────┘
//!        └──► Fatal ──► fatal slot ──► close connection, exit
//! ```

use tokio::sync::{mpsc, oneshot};

use crate::config::ConsumerConfig;
use crate::domain::{Ack, Disposition, Item, JobId};
use crate::error::BrokerError;
use crate::ports::{Connection, Reservation};

/// One reserved item plus the way back to the dispatch loop.
pub struct Delivery {
    pub item: Item,
    pub ack: oneshot::Sender<Disposition>,
}

/// Subscriber side of a dispatch session.
pub struct Session {
    /// Carries at most one error, after which the session is over.
    pub fatal: oneshot::Receiver<BrokerError>,
    pub items: mpsc::Receiver<Delivery>,
}

pub struct DispatchLoop {
    conn: Box<dyn Connection>,
    config: ConsumerConfig,
    items: mpsc::Sender<Delivery>,
    fatal: Option<oneshot::Sender<BrokerError>>,
}

/// Bind `conn` to a new session.
pub fn session(conn: Box<dyn Connection>, config: ConsumerConfig) -> (DispatchLoop, Session) {
    let (items_tx, items_rx) = mpsc::channel(1);
    let (fatal_tx, fatal_rx) = oneshot::channel();
    let dispatch = DispatchLoop {
        conn,
        config,
        items: items_tx,
        fatal: Some(fatal_tx),
    };
    let session = Session {
        fatal: fatal_rx,
        items: items_rx,
    };
    (dispatch, session)
}

impl DispatchLoop {
    /// Run until a fatal broker error or until the subscriber goes away.
    ///
    /// The connection is closed on every return path. A fatal error is
    /// published on the session before it is returned.
    pub async fn run(mut self) -> Result<(), BrokerError> {
        let exit = self.pump().await;
        if let Err(e) = &exit
            && let Some(fatal) = self.fatal.take()
        {
            // the subscriber may already be gone
            let _ = fatal.send(e.clone());
        }
        if let Err(e) = self.conn.close().await {
            tracing::error!(error = %e, "close broker connection");
        }
        exit
    }

    async fn pump(&mut self) -> Result<(), BrokerError> {
        loop {
            let item = match self.conn.reserve(self.config.reserve_timeout).await {
                Reservation::Timeout => {
                    tracing::debug!("reserve timed out");
                    continue;
                }
                Reservation::Fatal(e) => {
                    tracing::error!(error = %e, "beanstalk reserve error");
                    return Err(e);
                }
                Reservation::Delivered(item) => item,
            };

            let id = item.id();
            tracing::info!(%id, body = %item.body_lossy(), "reserve new message");

            let (ack, done) = oneshot::channel();
            if self.items.send(Delivery { item, ack }).await.is_err() {
                tracing::debug!(%id, "subscriber gone, stopping dispatch");
                return Ok(());
            }
            let Ok(disposition) = done.await else {
                // job goes back to the broker when the connection closes
                tracing::warn!(%id, "item dropped without a disposition");
                return Ok(());
            };
            self.apply(id, &disposition).await;
        }
    }

    async fn apply(&mut self, id: JobId, disposition: &Disposition) {
        match disposition.resolve(&self.config) {
            Ack::Delete => {
                tracing::info!(%id, "beanstalk delete");
                if let Err(e) = self.conn.delete(id).await {
                    tracing::error!(%id, error = %e, "beanstalk delete failed");
                }
            }
            Ack::Release { priority, delay } => {
                tracing::info!(%id, ?delay, priority, "beanstalk release");
                if let Err(e) = self.conn.release(id, priority, delay).await {
                    tracing::error!(%id, error = %e, "beanstalk release failed");
                }
            }
        }
    }
}
