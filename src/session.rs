//! Device sessions and their dispatcher tasks.
//!
//! Each session owns one transport and one priority queue. Its dispatcher
//! task runs the exchange state machine:
//!
//! ```text
//! Idle -> Sending -> AwaitingResponse -> Idle
//!   \________________________________________-> Draining (shutdown)
//! ```
//!
//! One request is on the wire per session at a time. A received frame is
//! accepted only if it correlates with that request; anything else is an
//! orphan and is dropped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::StackConfig;
use crate::error::{CompletionStatus, ModbusResult};
use crate::frame::{decode_rtu_response, decode_tcp_response, FrameFormat, ResponseFrame};
use crate::queue::Shutdown;
use crate::request_table::{RequestEntry, SessionKey};
use crate::transport::{FrameTransport, TransportFactory};
use crate::utils::PerformanceMetrics;

/// Dispatcher state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Sending,
    AwaitingResponse,
    Draining,
}

struct QueuedEntry {
    priority: i64,
    seq: u64,
    entry: RequestEntry,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    // BinaryHeap pops the maximum, so lower priority values and earlier
    // arrivals must compare greater.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority-ordered outbound queue of a session.
///
/// Lower priority value first, FIFO among equal priorities. Once closed it
/// refuses new entries.
pub struct SessionQueue {
    heap: Mutex<BinaryHeap<QueuedEntry>>,
    signal: Semaphore,
    accepting: AtomicBool,
    seq: AtomicU64,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            signal: Semaphore::new(0),
            accepting: AtomicBool::new(true),
            seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BinaryHeap<QueuedEntry>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an entry, handing it back if the queue is closed
    pub fn push(&self, entry: RequestEntry) -> Result<(), RequestEntry> {
        {
            let mut heap = self.lock();
            if !self.is_accepting() {
                return Err(entry);
            }
            heap.push(QueuedEntry {
                priority: entry.priority,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                entry,
            });
        }
        self.signal.add_permits(1);
        Ok(())
    }

    /// Wait for the most urgent entry; `None` once shutdown is raised
    pub async fn pop(&self, shutdown: &mut Shutdown) -> Option<RequestEntry> {
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            tokio::select! {
                biased;
                _ = shutdown.triggered() => return None,
                permit = self.signal.acquire() => {
                    permit.ok()?.forget();
                    if let Some(queued) = self.lock().pop() {
                        return Some(queued.entry);
                    }
                }
            }
        }
    }

    /// Refuse further entries and hand back everything still queued
    pub fn close(&self) -> Vec<RequestEntry> {
        let mut heap = self.lock();
        self.accepting.store(false, Ordering::Release);
        let mut drained = Vec::with_capacity(heap.len());
        while let Some(queued) = heap.pop() {
            drained.push(queued.entry);
        }
        drained
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared half of a session, visible to producers and the dispatcher
struct SessionShared {
    key: SessionKey,
    queue: SessionQueue,
    state: watch::Sender<SessionState>,
    metrics: Mutex<PerformanceMetrics>,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn metrics(&self) -> MutexGuard<'_, PerformanceMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One device session: its queue plus the dispatcher task draining it
pub struct Session {
    shared: Arc<SessionShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn spawn(
        key: SessionKey,
        runtime: &Handle,
        factory: Arc<dyn TransportFactory>,
        config: StackConfig,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Idle);
        let shared = Arc::new(SessionShared {
            key,
            queue: SessionQueue::new(),
            state,
            metrics: Mutex::new(PerformanceMetrics::new()),
        });

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            factory,
            config,
            shutdown,
            transport: None,
            last_sent: None,
        };
        let task = runtime.spawn(dispatcher.run());

        info!("Created session {}", key);
        Arc::new(Self {
            shared,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.shared.key
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.shared.metrics().clone()
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Correlation {
    Matched(ResponseFrame),
    Orphan(String),
}

struct Dispatcher {
    shared: Arc<SessionShared>,
    factory: Arc<dyn TransportFactory>,
    config: StackConfig,
    shutdown: Shutdown,
    transport: Option<Box<dyn FrameTransport>>,
    last_sent: Option<Instant>,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            self.shared.set_state(SessionState::Idle);
            let entry = match self.shared.queue.pop(&mut self.shutdown).await {
                Some(entry) => entry,
                None => break,
            };

            if let Flow::Stop = self.dispatch(entry).await {
                break;
            }
        }
        self.drain().await;
    }

    async fn dispatch(&mut self, entry: RequestEntry) -> Flow {
        if self.transport.is_none() {
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => {
                    entry.complete(CompletionStatus::Shutdown, None);
                    return Flow::Stop;
                }
                result = self.factory.connect(self.shared.key) => result,
            };
            match connected {
                Ok(transport) => self.transport = Some(transport),
                Err(e) => {
                    error!("Session {}: cannot open transport: {}", self.shared.key, e);
                    self.shared.metrics().record_failure(std::time::Duration::ZERO);
                    entry.complete(CompletionStatus::Transport(e.to_string()), None);
                    return Flow::Continue;
                }
            }
        }

        let started = Instant::now();
        let attempts = self.config.max_retries + 1;

        for attempt in 1..=attempts {
            if let Some(last) = self.last_sent {
                let ready = last + self.config.inter_frame_delay();
                tokio::select! {
                    biased;
                    _ = self.shutdown.triggered() => {
                        entry.complete(CompletionStatus::Shutdown, None);
                        return Flow::Stop;
                    }
                    _ = sleep_until(ready) => {}
                }
            }

            self.shared.set_state(SessionState::Sending);
            let sent = match self.transport.as_mut() {
                Some(transport) => transport.send_frame(&entry.frame).await,
                None => Err(crate::error::ModbusError::connection("transport closed")),
            };
            self.last_sent = Some(Instant::now());
            if let Err(e) = sent {
                error!("Session {}: send failed for transaction {}: {}", self.shared.key, entry.transaction_id(), e);
                self.transport = None;
                self.shared.metrics().record_failure(started.elapsed());
                entry.complete(CompletionStatus::Transport(e.to_string()), None);
                return Flow::Continue;
            }
            debug!(
                "Session {}: sent transaction {} (attempt {}/{})",
                self.shared.key,
                entry.transaction_id(),
                attempt,
                attempts
            );

            self.shared.set_state(SessionState::AwaitingResponse);
            let deadline = Instant::now() + self.config.response_timeout();

            loop {
                let transport = match self.transport.as_mut() {
                    Some(transport) => transport,
                    None => break,
                };
                let received = tokio::select! {
                    biased;
                    _ = self.shutdown.triggered() => {
                        entry.complete(CompletionStatus::Shutdown, None);
                        return Flow::Stop;
                    }
                    received = timeout_at(deadline, transport.recv_frame()) => received,
                };

                match received {
                    Err(_) => break,
                    Ok(Err(e)) if e.is_transport_error() => {
                        error!("Session {}: receive failed: {}", self.shared.key, e);
                        self.transport = None;
                        self.shared.metrics().record_failure(started.elapsed());
                        entry.complete(CompletionStatus::Transport(e.to_string()), None);
                        return Flow::Continue;
                    }
                    Ok(Err(e)) => {
                        warn!("Session {}: discarding malformed frame: {}", self.shared.key, e);
                    }
                    Ok(Ok(frame)) => match correlate(self.factory.format(), &entry, &frame) {
                        Ok(Correlation::Matched(response)) => {
                            let status = match response.exception {
                                Some(code) => CompletionStatus::Exception(code),
                                None => CompletionStatus::Success,
                            };
                            self.shared.metrics().record_success(started.elapsed());
                            entry.complete(status, Some(&response));
                            return Flow::Continue;
                        }
                        Ok(Correlation::Orphan(reason)) => {
                            warn!("Session {}: dropping orphan response ({})", self.shared.key, reason);
                            self.shared.metrics().orphan_responses += 1;
                        }
                        Err(e) => {
                            warn!("Session {}: discarding undecodable frame: {}", self.shared.key, e);
                        }
                    },
                }
            }

            self.shared.metrics().timeouts += 1;
            if attempt < attempts {
                self.shared.metrics().retries += 1;
                warn!(
                    "Session {}: transaction {} timed out, retrying ({}/{})",
                    self.shared.key,
                    entry.transaction_id(),
                    attempt,
                    self.config.max_retries
                );
            }
        }

        warn!(
            "Session {}: transaction {} failed after {} attempt(s)",
            self.shared.key,
            entry.transaction_id(),
            attempts
        );
        self.shared.metrics().record_failure(started.elapsed());
        entry.complete(CompletionStatus::Timeout, None);
        Flow::Continue
    }

    async fn drain(&mut self) {
        self.shared.set_state(SessionState::Draining);
        let drained = self.shared.queue.close();
        if !drained.is_empty() {
            info!("Session {}: failing {} queued request(s) on shutdown", self.shared.key, drained.len());
        }
        for entry in drained {
            entry.complete(CompletionStatus::Shutdown, None);
        }
        if let Some(mut transport) = self.transport.take() {
            let stats = transport.stats();
            debug!(
                "Session {}: closing transport ({} frame(s) sent, {} received, {} error(s))",
                self.shared.key, stats.frames_sent, stats.frames_received, stats.errors
            );
            let _ = transport.close().await;
        }
        let metrics = self.shared.metrics().clone();
        info!(
            "Session {} stopped: {} request(s), {:.1}% answered, avg {:?}, {} timeout(s), {} orphan(s)",
            self.shared.key,
            metrics.total_requests,
            metrics.success_rate(),
            metrics.avg_duration(),
            metrics.timeouts,
            metrics.orphan_responses
        );
    }
}

fn correlate(format: FrameFormat, entry: &RequestEntry, frame: &[u8]) -> ModbusResult<Correlation> {
    let response = match format {
        FrameFormat::Tcp => decode_tcp_response(frame)?,
        FrameFormat::Rtu => decode_rtu_response(frame)?,
    };

    if let Some(transaction_id) = response.transaction_id {
        if transaction_id != entry.transaction_id() {
            return Ok(Correlation::Orphan(format!(
                "transaction {} while awaiting {}",
                transaction_id,
                entry.transaction_id()
            )));
        }
    }
    if response.unit_id != entry.device.unit_id {
        return Ok(Correlation::Orphan(format!(
            "unit {} while awaiting unit {}",
            response.unit_id, entry.device.unit_id
        )));
    }
    if response.function != entry.function.to_u8() {
        return Ok(Correlation::Orphan(format!(
            "function 0x{:02X} while awaiting 0x{:02X}",
            response.function,
            entry.function.to_u8()
        )));
    }

    Ok(Correlation::Matched(response))
}

/// Owned collection of sessions, keyed by session identity
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
    factory: Arc<dyn TransportFactory>,
    config: StackConfig,
    runtime: Handle,
    shutdown: Shutdown,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, config: StackConfig, runtime: Handle, shutdown: Shutdown) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            config,
            runtime,
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn format(&self) -> FrameFormat {
        self.factory.format()
    }

    /// Hand an entry to its session, creating the session on first use.
    ///
    /// The entry comes back if the stack is shutting down.
    pub fn enqueue(&self, entry: RequestEntry) -> Result<(), RequestEntry> {
        if self.shutdown.is_triggered() {
            return Err(entry);
        }
        let session = {
            let mut sessions = self.lock();
            let key = entry.device.session;
            Arc::clone(sessions.entry(key).or_insert_with(|| {
                Session::spawn(
                    key,
                    &self.runtime,
                    Arc::clone(&self.factory),
                    self.config,
                    self.shutdown.clone(),
                )
            }))
        };
        session.shared.queue.push(entry)
    }

    pub fn session(&self, key: SessionKey) -> Option<Arc<Session>> {
        self.lock().get(&key).cloned()
    }

    /// Wait for every dispatcher to drain. The shutdown flag must already
    /// be raised.
    pub async fn join(&self) {
        let tasks: Vec<_> = self.lock().values().filter_map(|session| session.take_task()).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Session task ended abnormally: {}", e);
            }
        }
    }
}
