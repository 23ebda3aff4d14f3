//! The pending request pool and the batch builder on top of it.
//!
//! The pool is a bounded FIFO with duplicate rejection. Requests stay in
//! the pool until they are pruned after delivery, so an aborted proposal
//! loses nothing. A timer task watches the oldest request: after the
//! request timeout it is forwarded to the leader, and if it still is not
//! ordered after the leader forward timeout, the leader is presumed
//! faulty and a view change is requested. Both timers pause across view
//! changes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{debug, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::bft::api::{Batcher, PoolTimeoutHandler, RequestInspector, RequestPool, RequestsTimer};
use crate::bft::collections::{self, HashSet};
use crate::bft::error::*;
use crate::bft::types::{NodeId, RequestInfo};

/// Default capacity of the request pool.
pub const DEFAULT_REQUEST_POOL_SIZE: usize = 200;

/// How often the pool checks its oldest request.
const TIMER_GRANULARITY: Duration = Duration::from_millis(50);

/// How often the batch builder polls the pool while a batch is filling.
const BATCH_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub queue_size: usize,
    /// Age after which a pending request is forwarded to the leader.
    pub request_timeout: Duration,
    /// Additional age after which the leader is presumed faulty.
    pub leader_fwd_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_REQUEST_POOL_SIZE,
            request_timeout: Duration::from_secs(2),
            leader_fwd_timeout: Duration::from_secs(20),
        }
    }
}

struct StoredRequest {
    info: RequestInfo,
    raw: Vec<u8>,
    arrived: Instant,
    forwarded: bool,
}

struct PoolInner {
    fifo: VecDeque<StoredRequest>,
    keys: HashSet<String>,
}

pub struct Pool {
    self_id: NodeId,
    options: PoolOptions,
    inspector: Arc<dyn RequestInspector>,
    handler: OnceCell<Arc<dyn PoolTimeoutHandler>>,
    inner: Mutex<PoolInner>,
    timers_stopped: AtomicBool,
    closed: AtomicBool,
    stop_rx: Receiver<()>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    pub fn new(
        self_id: NodeId,
        inspector: Arc<dyn RequestInspector>,
        options: PoolOptions,
    ) -> Arc<Self> {
        let (stop_tx, stop_rx) = bounded(1);
        Arc::new(Self {
            self_id,
            options,
            inspector,
            handler: OnceCell::new(),
            inner: Mutex::new(PoolInner {
                fifo: VecDeque::new(),
                keys: collections::hash_set(),
            }),
            timers_stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop_rx,
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(None),
        })
    }

    pub fn bind_timeout_handler(&self, handler: Arc<dyn PoolTimeoutHandler>) {
        let _ = self.handler.set(handler);
    }

    /// Starts the timeout watcher.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        *self.thread.lock() = Some(
            std::thread::Builder::new()
                .name("request-pool-timers".into())
                .spawn(move || pool.run_timers())
                .unwrap(),
        );
    }

    fn run_timers(&self) {
        loop {
            select! {
                recv(self.stop_rx) -> _ => return,
                default(TIMER_GRANULARITY) => self.check_oldest(),
            }
        }
    }

    fn check_oldest(&self) {
        if self.timers_stopped.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return;
        }
        let handler = match self.handler.get() {
            Some(handler) => handler,
            None => return,
        };

        enum Action {
            Forward(Vec<u8>, RequestInfo),
            Escalate(RequestInfo),
        }

        let action = {
            let now = Instant::now();
            let mut inner = self.inner.lock();
            match inner.fifo.front_mut() {
                None => return,
                Some(oldest) => {
                    let age = now.duration_since(oldest.arrived);
                    if oldest.forwarded {
                        if age < self.options.leader_fwd_timeout {
                            return;
                        }
                        oldest.arrived = now;
                        Action::Escalate(oldest.info.clone())
                    } else {
                        if age < self.options.request_timeout {
                            return;
                        }
                        oldest.forwarded = true;
                        oldest.arrived = now;
                        Action::Forward(oldest.raw.clone(), oldest.info.clone())
                    }
                }
            }
        };

        match action {
            Action::Forward(raw, info) => {
                debug!(
                    "{:?} // Request {} timed out, forwarding to the leader",
                    self.self_id,
                    info.key()
                );
                handler.on_request_timeout(raw, &info);
            }
            Action::Escalate(info) => {
                warn!(
                    "{:?} // Request {} still pending after forwarding, complaining about the leader",
                    self.self_id,
                    info.key()
                );
                handler.on_leader_fwd_timeout();
            }
        }
    }
}

impl RequestPool for Pool {
    fn submit(&self, request: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::simple(ErrorKind::RequestPoolClosed));
        }
        let info = self.inspector.request_id(&request);
        let key = info.key();

        let mut inner = self.inner.lock();
        if inner.keys.contains(&key) {
            return Err(Error::simple(ErrorKind::RequestAlreadyExists));
        }
        if inner.fifo.len() >= self.options.queue_size {
            return Err(Error::simple(ErrorKind::RequestPoolFull));
        }
        inner.keys.insert(key);
        inner.fifo.push_back(StoredRequest {
            info,
            raw: request,
            arrived: Instant::now(),
            forwarded: false,
        });
        Ok(())
    }

    fn next_requests(&self, n: usize) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .fifo
            .iter()
            .take(n)
            .map(|stored| stored.raw.clone())
            .collect()
    }

    fn prune(&self, requests: &[RequestInfo]) {
        if requests.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        for info in requests {
            inner.keys.remove(&info.key());
        }
        let PoolInner { fifo, keys } = &mut *inner;
        fifo.retain(|stored| keys.contains(&stored.info.key()));
    }

    fn size(&self) -> usize {
        self.inner.lock().fifo.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.stop_tx.lock().take();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl RequestsTimer for Pool {
    fn stop_timers(&self) {
        self.timers_stopped.store(true, Ordering::Release);
    }

    fn restart_timers(&self) {
        self.timers_stopped.store(false, Ordering::Release);
    }
}

/// Builds batches out of the request pool: a batch is released as soon
/// as it is full, or when the batch timeout elapses, whichever happens
/// first.
pub struct BatchBuilder {
    pool: Arc<dyn RequestPool>,
    batch_size: usize,
    batch_timeout: Duration,
    remainder: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    close_rx: Receiver<()>,
    close_tx: Mutex<Option<Sender<()>>>,
}

impl BatchBuilder {
    pub fn new(pool: Arc<dyn RequestPool>, batch_size: usize, batch_timeout: Duration) -> Self {
        let (close_tx, close_rx) = bounded(1);
        Self {
            pool,
            batch_size,
            batch_timeout,
            remainder: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_rx,
            close_tx: Mutex::new(Some(close_tx)),
        }
    }
}

impl Batcher for BatchBuilder {
    fn next_batch(&self) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + self.batch_timeout;
        let base = self.pop_remainder();

        loop {
            if self.closed() {
                return Vec::new();
            }

            let mut batch = base.clone();
            for raw in self.pool.next_requests(self.batch_size) {
                if batch.len() >= self.batch_size {
                    break;
                }
                if !batch.contains(&raw) {
                    batch.push(raw);
                }
            }

            if batch.len() >= self.batch_size || Instant::now() >= deadline {
                return batch;
            }

            select! {
                recv(self.close_rx) -> _ => return Vec::new(),
                default(BATCH_POLL) => {}
            }
        }
    }

    fn batch_remainder(&self, mut remainder: Vec<Vec<u8>>) {
        let mut held = self.remainder.lock();
        remainder.append(&mut held);
        *held = remainder;
    }

    fn pop_remainder(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.remainder.lock())
    }

    fn reset(&self) {
        self.remainder.lock().clear();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.close_tx.lock().take();
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
