//! InMemoryBroker - broker for development and tests
//!
//! Behaves like a single beanstalkd instance:
//! - tubes hold ready jobs ordered by `(priority, id)`; lower priority runs first
//! - `delay` parks a job until it elapses
//! - a reserved job returns to ready when its TTR expires or its connection closes
//! - every connection starts out watching `"default"`
//!
//! Every put/reserve/delete/release is appended to an operation log that tests
//! can inspect with [`InMemoryBroker::ops`]. The log keeps the most recent
//! [`DEFAULT_OP_LOG_CAPACITY`] entries unless sized otherwise.
//!
//! Durations too large to add to the clock (delay, TTR, reserve timeout) mean
//! "never": the job stays delayed, the reservation does not expire, the
//! reserve waits until woken.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::cmp::Reverse;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::{Item, JobId};
use crate::error::BrokerError;
use crate::ports::{Connection, DEFAULT_TUBE, Dialer, Reservation};

/// Smallest TTR the broker accepts (beanstalkd rounds 0 up to 1s as well).
const MIN_TTR: Duration = Duration::from_secs(1);

/// Operation log entries kept by [`InMemoryBroker::new`].
pub const DEFAULT_OP_LOG_CAPACITY: usize = 4096;

/// Stand-in deadline for durations that overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + after`, saturating at [`FAR_FUTURE`].
fn instant_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .unwrap_or_else(|| now.checked_add(FAR_FUTURE).unwrap_or(now))
}

/// One recorded broker operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Put {
        id: JobId,
        tube: String,
        priority: u32,
        delay: Duration,
    },
    Reserve {
        id: JobId,
        connection: u64,
    },
    Delete {
        id: JobId,
    },
    Release {
        id: JobId,
        priority: u32,
        delay: Duration,
    },
}

/// Externally visible state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Ready,
    Delayed,
    Reserved,
}

#[derive(Debug, Clone, Copy)]
enum JobState {
    Ready,
    Delayed { until: Instant },
    Reserved { connection: u64, deadline: Instant },
}

#[derive(Debug)]
struct JobRecord {
    tube: String,
    body: Vec<u8>,
    priority: u32,
    ttr: Duration,
    state: JobState,
}

struct BrokerState {
    next_job_id: u64,
    next_connection_id: u64,
    jobs: HashMap<JobId, JobRecord>,
    /// Ready queue per tube (ids only; records live in `jobs`).
    ready: HashMap<String, BinaryHeap<Reverse<(u32, JobId)>>>,
    ops: VecDeque<BrokerOp>,
    op_log_capacity: usize,
    shut_down: bool,
}

impl BrokerState {
    fn new(op_log_capacity: usize) -> Self {
        Self {
            next_job_id: 0,
            next_connection_id: 0,
            jobs: HashMap::new(),
            ready: HashMap::new(),
            ops: VecDeque::new(),
            op_log_capacity,
            shut_down: false,
        }
    }

    fn record(&mut self, op: BrokerOp) {
        if self.op_log_capacity == 0 {
            return;
        }
        if self.ops.len() == self.op_log_capacity {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }

    fn allocate_job_id(&mut self) -> JobId {
        self.next_job_id += 1;
        JobId::new(self.next_job_id)
    }

    fn allocate_connection_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }

    fn make_ready(&mut self, id: JobId) {
        if let Some(record) = self.jobs.get_mut(&id) {
            record.state = JobState::Ready;
            self.ready
                .entry(record.tube.clone())
                .or_default()
                .push(Reverse((record.priority, id)));
        }
    }

    /// Move elapsed delays and expired reservations back to ready.
    fn promote(&mut self, now: Instant) {
        let due: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, record)| match record.state {
                JobState::Ready => false,
                JobState::Delayed { until } => until <= now,
                JobState::Reserved { deadline, .. } => deadline <= now,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.make_ready(id);
        }
    }

    /// Earliest instant at which `promote` would change something.
    fn next_wake(&self) -> Option<Instant> {
        self.jobs
            .values()
            .filter_map(|record| match record.state {
                JobState::Ready => None,
                JobState::Delayed { until } => Some(until),
                JobState::Reserved { deadline, .. } => Some(deadline),
            })
            .min()
    }

    /// Pop the most urgent ready job across `tubes`.
    fn pop_ready(&mut self, tubes: &[String]) -> Option<JobId> {
        let tube = tubes
            .iter()
            .filter_map(|tube| {
                self.ready
                    .get(tube)
                    .and_then(|heap| heap.peek())
                    .map(|Reverse(key)| (*key, tube))
            })
            .min_by_key(|(key, _)| *key)
            .map(|(_, tube)| tube.clone())?;
        self.ready
            .get_mut(&tube)
            .and_then(|heap| heap.pop())
            .map(|Reverse((_, id))| id)
    }

    fn release_reserved_by(&mut self, connection: u64) {
        let held: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, record)| {
                matches!(record.state, JobState::Reserved { connection: c, .. } if c == connection)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in held {
            self.make_ready(id);
        }
    }

    fn reserved_by(&self, id: JobId, connection: u64) -> Result<(), BrokerError> {
        match self.jobs.get(&id).map(|record| record.state) {
            Some(JobState::Reserved { connection: c, .. }) if c == connection => Ok(()),
            _ => Err(BrokerError::NotFound(id)),
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent even if a holder panicked: every mutation is
        // completed before the guard drops.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_op_log_capacity(DEFAULT_OP_LOG_CAPACITY)
    }

    /// Keep at most `capacity` operation log entries; 0 disables the log.
    pub fn with_op_log_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::new(capacity)),
                notify: Notify::new(),
            }),
        }
    }

    /// Open a connection without going through an address.
    pub fn connect(&self) -> Result<InMemoryConnection, BrokerError> {
        let mut state = self.shared.lock();
        if state.shut_down {
            return Err(BrokerError::ConnectionClosed);
        }
        let id = state.allocate_connection_id();
        Ok(InMemoryConnection {
            id,
            shared: Arc::clone(&self.shared),
            watched: vec![DEFAULT_TUBE.to_string()],
            closed: false,
        })
    }

    /// Break every connection, current and future.
    pub fn shutdown(&self) {
        self.shared.lock().shut_down = true;
        self.shared.notify.notify_waiters();
    }

    /// Snapshot of the operation log, oldest first.
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.shared.lock().ops.iter().cloned().collect()
    }

    pub fn job_status(&self, id: JobId) -> Option<JobStatus> {
        let mut state = self.shared.lock();
        state.promote(Instant::now());
        state.jobs.get(&id).map(|record| match record.state {
            JobState::Ready => JobStatus::Ready,
            JobState::Delayed { .. } => JobStatus::Delayed,
            JobState::Reserved { .. } => JobStatus::Reserved,
        })
    }

    /// Priority currently stored for a job.
    pub fn job_priority(&self, id: JobId) -> Option<u32> {
        self.shared.lock().jobs.get(&id).map(|record| record.priority)
    }

    /// Number of jobs the broker still holds (any state).
    pub fn len(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for InMemoryBroker {
    async fn dial(&self, addr: &str) -> Result<Box<dyn Connection>, BrokerError> {
        if addr.trim().is_empty() {
            return Err(BrokerError::Dial {
                addr: addr.to_string(),
                reason: "empty address".to_string(),
            });
        }
        let conn = self.connect().map_err(|_| BrokerError::Dial {
            addr: addr.to_string(),
            reason: "broker is shut down".to_string(),
        })?;
        Ok(Box::new(conn))
    }
}

/// A connection to an [`InMemoryBroker`].
pub struct InMemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    watched: Vec<String>,
    closed: bool,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn watched(&self) -> &[String] {
        &self.watched
    }

    fn guard(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.shared.lock();
        if self.closed || state.shut_down {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn put(
        &mut self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, BrokerError> {
        let id = {
            let mut state = self.guard()?;
            let id = state.allocate_job_id();
            let job_state = if delay.is_zero() {
                JobState::Ready
            } else {
                JobState::Delayed {
                    until: instant_after(Instant::now(), delay),
                }
            };
            state.jobs.insert(
                id,
                JobRecord {
                    tube: tube.to_string(),
                    body: body.to_vec(),
                    priority,
                    ttr: ttr.max(MIN_TTR),
                    state: job_state,
                },
            );
            if delay.is_zero() {
                state.make_ready(id);
            }
            state.record(BrokerOp::Put {
                id,
                tube: tube.to_string(),
                priority,
                delay,
            });
            id
        };
        self.shared.notify.notify_waiters();
        Ok(id)
    }

    async fn watch(&mut self, tube: &str) -> Result<usize, BrokerError> {
        drop(self.guard()?);
        if !self.watched.iter().any(|t| t == tube) {
            self.watched.push(tube.to_string());
        }
        Ok(self.watched.len())
    }

    async fn ignore(&mut self, tube: &str) -> Result<usize, BrokerError> {
        drop(self.guard()?);
        if self.watched.len() == 1 && self.watched[0] == tube {
            return Err(BrokerError::Protocol(
                "cannot ignore the only watched tube".to_string(),
            ));
        }
        self.watched.retain(|t| t != tube);
        Ok(self.watched.len())
    }

    async fn reserve(&mut self, timeout: Duration) -> Reservation {
        let deadline = instant_after(Instant::now(), timeout);
        loop {
            // register for wakeups before looking at state, or a notify_waiters can be missed
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = match self.guard() {
                    Ok(state) => state,
                    Err(e) => return Reservation::Fatal(e),
                };
                let now = Instant::now();
                state.promote(now);
                if let Some(id) = state.pop_ready(&self.watched) {
                    let connection = self.id;
                    let item = state.jobs.get_mut(&id).map(|record| {
                        record.state = JobState::Reserved {
                            connection,
                            deadline: instant_after(now, record.ttr),
                        };
                        Item::new(id, record.tube.clone(), record.body.clone())
                    });
                    if let Some(item) = item {
                        state.record(BrokerOp::Reserve { id, connection });
                        return Reservation::Delivered(item);
                    }
                    continue;
                }
                if now >= deadline {
                    return Reservation::Timeout;
                }
                state.next_wake()
            };

            let wake = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {},
                _ = tokio::time::sleep_until(wake) => {},
            }
        }
    }

    async fn delete(&mut self, id: JobId) -> Result<(), BrokerError> {
        let mut state = self.guard()?;
        state.reserved_by(id, self.id)?;
        state.jobs.remove(&id);
        state.record(BrokerOp::Delete { id });
        Ok(())
    }

    async fn release(
        &mut self,
        id: JobId,
        priority: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.guard()?;
            state.reserved_by(id, self.id)?;
            if let Some(record) = state.jobs.get_mut(&id) {
                record.priority = priority;
                if !delay.is_zero() {
                    record.state = JobState::Delayed {
                        until: instant_after(Instant::now(), delay),
                    };
                }
            }
            if delay.is_zero() {
                state.make_ready(id);
            }
            state.record(BrokerOp::Release {
                id,
                priority,
                delay,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::ConnectionClosed);
        }
        self.closed = true;
        self.shared.lock().release_reserved_by(self.id);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.lock().release_reserved_by(self.id);
            self.shared.notify.notify_waiters();
        }
    }
}
