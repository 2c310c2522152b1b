//! The request-processor pool: a fixed set of worker threads draining a
//! bounded FIFO queue of `(session, message)` pairs.
//!
//! Workers spin-read the queue depth before sleeping when wakeups arrive in
//! bursts; the spin limit adapts from the interval between wakeups. Session
//! teardown is deferred while messages are in flight: the worker that
//! drains a stopping session's last message performs the cleanup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use silo_error::Result;
use silo_types::{Datastore, SessionId};
use tracing::{debug, warn};

use crate::dispatch::{self, Msg, ResponseSink};
use crate::store::{DataStore, StoreSession};

/// Number of worker threads.
pub const RP_THREAD_COUNT: usize = 4;

/// Initial capacity of the request queue (it grows on demand).
const RP_INIT_REQ_QUEUE_SIZE: usize = 10;

/// Requests that may be waiting per active thread before another thread is
/// woken.
const RP_REQ_PER_THREADS: usize = 2;

/// Wakeup interval below which thread spinning is enabled (half a
/// millisecond).
const RP_THREAD_SPIN_TIMEOUT_NS: u128 = 500_000;

/// Minimum spin cycles before going to sleep, once spinning is enabled.
const RP_THREAD_SPIN_MIN: u64 = 1_000;

/// Maximum spin cycles before going to sleep.
const RP_THREAD_SPIN_MAX: u64 = 1_000_000;

/// Per-session request-processor state.
pub struct RpSession {
    id: SessionId,
    datastore: Datastore,
    store_session: Mutex<Box<dyn StoreSession>>,
    msg_state: Mutex<MsgState>,
    cleaned: AtomicBool,
}

struct MsgState {
    /// Unprocessed messages, including those waiting in the queue.
    count: u32,
    /// Session stop has been requested; the last drained message cleans up.
    stop_requested: bool,
}

impl RpSession {
    /// The session id.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The datastore this session operates on.
    #[must_use]
    pub fn datastore(&self) -> Datastore {
        self.datastore
    }

    /// Borrow the storage session.
    pub(crate) fn store_session(&self) -> MutexGuard<'_, Box<dyn StoreSession>> {
        self.store_session.lock()
    }

    /// Messages currently unprocessed for this session.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.msg_state.lock().count
    }

    /// Whether cleanup has run.
    #[must_use]
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session = %self.id, "request-processor session cleanup");
        self.store_session.lock().close();
    }
}

/// One queued request; a pair of `None`s is the worker-exit sentinel.
struct RpRequest {
    session: Option<Arc<RpSession>>,
    msg: Option<Msg>,
}

struct RpQueue {
    buf: VecDeque<RpRequest>,
    /// Number of active (non-sleeping) workers.
    active_threads: usize,
    /// Timestamp of the last worker wakeup.
    last_wakeup: Option<Instant>,
    /// Current spin limit before a worker goes to sleep.
    spin_limit: u64,
    /// Pool shutdown has been requested.
    stop_requested: bool,
}

struct RpInner {
    store: Arc<dyn DataStore>,
    sink: Arc<dyn ResponseSink>,
    queue: Mutex<RpQueue>,
    queue_cv: Condvar,
    /// Queue depth mirror read by the lock-free spin loop.
    queue_len: AtomicUsize,
}

/// The request processor: worker pool plus queue.
pub struct RequestProcessor {
    inner: Arc<RpInner>,
    workers: Vec<JoinHandle<()>>,
}

impl RequestProcessor {
    /// Start the pool.
    pub fn new(store: Arc<dyn DataStore>, sink: Arc<dyn ResponseSink>) -> Result<Self> {
        let inner = Arc::new(RpInner {
            store,
            sink,
            queue: Mutex::new(RpQueue {
                buf: VecDeque::with_capacity(RP_INIT_REQ_QUEUE_SIZE),
                active_threads: 0,
                last_wakeup: None,
                spin_limit: 0,
                stop_requested: false,
            }),
            queue_cv: Condvar::new(),
            queue_len: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(RP_THREAD_COUNT);
        for i in 0..RP_THREAD_COUNT {
            let worker_inner = Arc::clone(&inner);
            let spawned = std::thread::Builder::new()
                .name(format!("silo-rp-{i}"))
                .spawn(move || worker_loop(&worker_inner));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Wind down the workers that did start.
                    {
                        let mut q = inner.queue.lock();
                        q.stop_requested = true;
                        for _ in 0..workers.len() {
                            q.buf.push_back(RpRequest {
                                session: None,
                                msg: None,
                            });
                        }
                        inner.queue_cv.notify_all();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        debug!(threads = RP_THREAD_COUNT, "request processor started");
        Ok(Self { inner, workers })
    }

    /// Open the request-processor side of a session.
    pub fn session_start(&self, id: SessionId, datastore: Datastore) -> Result<Arc<RpSession>> {
        let store_session = self.inner.store.session_start(datastore)?;
        debug!(session = %id, %datastore, "request-processor session started");
        Ok(Arc::new(RpSession {
            id,
            datastore,
            store_session: Mutex::new(store_session),
            msg_state: Mutex::new(MsgState {
                count: 0,
                stop_requested: false,
            }),
            cleaned: AtomicBool::new(false),
        }))
    }

    /// Stop a session. Cleans up immediately when no messages are in
    /// flight; otherwise the worker draining the last message cleans up.
    pub fn session_stop(&self, session: &Arc<RpSession>) {
        debug!(session = %session.id, "request-processor session stop");
        let mut state = session.msg_state.lock();
        if state.count > 0 {
            warn!(
                session = %session.id,
                unprocessed = state.count,
                "session stopped with unprocessed messages, deferring cleanup"
            );
            state.stop_requested = true;
        } else {
            drop(state);
            session.cleanup();
        }
    }

    /// Enqueue one message for processing.
    pub fn process(&self, session: &Arc<RpSession>, msg: Msg) -> Result<()> {
        session.msg_state.lock().count += 1;

        let mut q = self.inner.queue.lock();
        q.buf.push_back(RpRequest {
            session: Some(Arc::clone(session)),
            msg: Some(msg),
        });
        self.inner.queue_len.store(q.buf.len(), Ordering::Relaxed);

        if q.active_threads == 0 {
            // No active thread: if wakeups are this frequent, let threads
            // spin before sleeping instead of paying the wake/sleep latency.
            let now = Instant::now();
            let elapsed = q
                .last_wakeup
                .map_or(u128::MAX, |prev| now.duration_since(prev).as_nanos());
            q.spin_limit = adapt_spin_limit(q.spin_limit, elapsed);
            q.last_wakeup = Some(now);
        }

        if q.active_threads == 0
            || (q.buf.len() / q.active_threads > RP_REQ_PER_THREADS
                && q.active_threads < RP_THREAD_COUNT)
        {
            self.inner.queue_cv.notify_one();
        }
        Ok(())
    }

    /// Current spin limit (observability for tests).
    #[must_use]
    pub fn spin_limit(&self) -> u64 {
        self.inner.queue.lock().spin_limit
    }

    /// Shut the pool down: set the stop flag, enqueue one sentinel per
    /// worker, broadcast, join all workers, and drain residual messages.
    pub fn shutdown(&mut self) {
        {
            let mut q = self.inner.queue.lock();
            if q.stop_requested {
                return;
            }
            debug!("request processor shutdown requested");
            q.stop_requested = true;
            for _ in 0..RP_THREAD_COUNT {
                q.buf.push_back(RpRequest {
                    session: None,
                    msg: None,
                });
            }
            self.inner.queue_len.store(q.buf.len(), Ordering::Relaxed);
            self.inner.queue_cv.notify_all();
        }

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        let mut q = self.inner.queue.lock();
        let residual = q.buf.len();
        q.buf.clear();
        self.inner.queue_len.store(0, Ordering::Relaxed);
        if residual > 0 {
            debug!(residual, "request queue drained on shutdown");
        }
    }
}

impl Drop for RequestProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The spin-limit adaptation: frequent wakeups enable and double the spin,
/// infrequent wakeups reset it.
fn adapt_spin_limit(current: u64, elapsed_ns: u128) -> u64 {
    if elapsed_ns < RP_THREAD_SPIN_TIMEOUT_NS {
        if current == 0 {
            RP_THREAD_SPIN_MIN
        } else if current < RP_THREAD_SPIN_MAX {
            current * 2
        } else {
            current
        }
    } else {
        0
    }
}

fn worker_loop(inner: &Arc<RpInner>) {
    debug!("worker thread starting");
    let mut exit = false;

    {
        let mut q = inner.queue.lock();
        q.active_threads += 1;
    }

    loop {
        // Process requests while there are some.
        let mut dequeued_prev = false;
        loop {
            let req = {
                let mut q = inner.queue.lock();
                let req = q.buf.pop_front();
                inner.queue_len.store(q.buf.len(), Ordering::Relaxed);
                req
            };

            match req {
                Some(RpRequest {
                    session: Some(session),
                    msg: Some(msg),
                }) => {
                    dispatch::dispatch(inner.sink.as_ref(), &session, msg);
                    finish_message(&session);
                    dequeued_prev = true;
                }
                Some(_) => {
                    debug!("worker received an empty request, exiting");
                    exit = true;
                    break;
                }
                None => {
                    // No items in queue: spin for a while, but only if this
                    // thread has processed something since its last wakeup.
                    if dequeued_prev {
                        let limit = { inner.queue.lock().spin_limit };
                        let mut count = 0_u64;
                        while inner.queue_len.load(Ordering::Relaxed) == 0 && count < limit {
                            count += 1;
                            std::hint::spin_loop();
                        }
                    }
                    let mut q = inner.queue.lock();
                    if !q.buf.is_empty() {
                        // Items arrived during the spin.
                        continue;
                    }
                    q.active_threads -= 1;
                    break;
                }
            }
        }
        if exit {
            break;
        }

        // Wait until a new request comes.
        let mut q = inner.queue.lock();
        if q.stop_requested {
            break;
        }
        inner.queue_cv.wait(&mut q);
        q.active_threads += 1;
    }

    debug!("worker thread exiting");
}

/// Post-dispatch bookkeeping: decrement the session's in-flight counter and
/// run the deferred cleanup when this was the last message of a stopping
/// session.
fn finish_message(session: &Arc<RpSession>) {
    let mut state = session.msg_state.lock();
    state.count -= 1;
    let cleanup = state.count == 0 && state.stop_requested;
    drop(state);
    if cleanup {
        session.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{OutMsg, Request, Response};
    use crate::store::{MemStore, SchemaInfo};
    use silo_error::ErrorCode;
    use std::time::Duration;

    /// Sink collecting every response.
    #[derive(Default)]
    struct CollectSink {
        sent: Mutex<Vec<OutMsg>>,
    }

    impl ResponseSink for CollectSink {
        fn send(&self, msg: OutMsg) -> Result<()> {
            self.sent.lock().push(msg);
            Ok(())
        }
    }

    fn sid(raw: u64) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    fn store() -> Arc<MemStore> {
        Arc::new(MemStore::new(vec![SchemaInfo {
            name: "m1".into(),
            revision: "2024-01-01".into(),
        }]))
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_worker_pool_saturation() {
        let sink = Arc::new(CollectSink::default());
        let mut rp = RequestProcessor::new(store(), Arc::clone(&sink) as _).unwrap();

        let sessions: Vec<_> = (1..=3)
            .map(|i| rp.session_start(sid(i), Datastore::Running).unwrap())
            .collect();

        // 12 fast requests enqueued back to back.
        for i in 0..12 {
            let session = &sessions[i % sessions.len()];
            rp.process(session, Msg::Request(Request::ListSchemas))
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || sink.sent.lock().len() == 12));
        for session in &sessions {
            assert_eq!(session.in_flight(), 0);
        }

        // A subsequent stop cleans up immediately.
        for session in &sessions {
            rp.session_stop(session);
            assert!(session.is_cleaned_up());
        }
        rp.shutdown();
    }

    #[test]
    fn test_deferred_cleanup_after_last_message() {
        let slow = Arc::new(MemStore::with_latency(
            Vec::new(),
            Duration::from_millis(50),
        ));
        let sink = Arc::new(CollectSink::default());
        let mut rp = RequestProcessor::new(slow, Arc::clone(&sink) as _).unwrap();

        let session = rp.session_start(sid(1), Datastore::Running).unwrap();
        for _ in 0..3 {
            rp.process(&session, Msg::Request(Request::DiscardChanges))
                .unwrap();
        }

        // Stop returns without cleanup while messages are in flight.
        rp.session_stop(&session);
        assert!(!session.is_cleaned_up());

        // The worker completing the last message performs the cleanup.
        assert!(wait_until(Duration::from_secs(5), || session.is_cleaned_up()));
        assert_eq!(session.in_flight(), 0);
        assert_eq!(sink.sent.lock().len(), 3);
        rp.shutdown();
    }

    #[test]
    fn test_each_request_yields_one_response() {
        let sink = Arc::new(CollectSink::default());
        let mut rp = RequestProcessor::new(store(), Arc::clone(&sink) as _).unwrap();
        let session = rp.session_start(sid(9), Datastore::Running).unwrap();

        rp.process(&session, Msg::Request(Request::GetItem { path: "/x".into() }))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || !sink.sent.lock().is_empty()));

        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].session_id, sid(9));
        match &sent[0].response {
            Response::GetItem { result, value } => {
                assert_eq!(*result, ErrorCode::NotFound);
                assert!(value.is_none());
            }
            other => panic!("unexpected response {other:?}"),
        }
        drop(sent);
        rp.shutdown();
    }

    #[test]
    fn test_response_message_is_dropped_as_unsupported() {
        let sink = Arc::new(CollectSink::default());
        let mut rp = RequestProcessor::new(store(), Arc::clone(&sink) as _).unwrap();
        let session = rp.session_start(sid(2), Datastore::Running).unwrap();

        rp.process(
            &session,
            Msg::Response(Response::SetItem {
                result: ErrorCode::Ok,
            }),
        )
        .unwrap();
        // The message drains without producing a response.
        assert!(wait_until(Duration::from_secs(5), || session.in_flight() == 0));
        assert!(sink.sent.lock().is_empty());
        rp.shutdown();
    }

    #[test]
    fn test_shutdown_joins_workers_and_drains() {
        let sink = Arc::new(CollectSink::default());
        let mut rp = RequestProcessor::new(store(), Arc::clone(&sink) as _).unwrap();
        let session = rp.session_start(sid(3), Datastore::Running).unwrap();
        rp.process(&session, Msg::Request(Request::ListSchemas))
            .unwrap();
        rp.shutdown();
        // Idempotent.
        rp.shutdown();
    }

    #[test]
    fn test_adapt_spin_limit_transitions() {
        // A slow wakeup keeps the spin disabled.
        assert_eq!(adapt_spin_limit(0, RP_THREAD_SPIN_TIMEOUT_NS), 0);
        // A fast wakeup enables the minimum spin.
        assert_eq!(adapt_spin_limit(0, 1), RP_THREAD_SPIN_MIN);
        // Subsequent fast wakeups double it.
        assert_eq!(adapt_spin_limit(RP_THREAD_SPIN_MIN, 1), RP_THREAD_SPIN_MIN * 2);
        // Capped at the maximum.
        assert_eq!(
            adapt_spin_limit(RP_THREAD_SPIN_MAX, 1),
            RP_THREAD_SPIN_MAX
        );
        let near_max = RP_THREAD_SPIN_MAX - 1;
        assert!(adapt_spin_limit(near_max, 1) >= RP_THREAD_SPIN_MAX - 1);
        // A slow wakeup resets an enabled spin.
        assert_eq!(adapt_spin_limit(RP_THREAD_SPIN_MIN, u128::MAX), 0);
    }

    #[test]
    fn test_no_thread_remains_spinning_after_burst() {
        let sink = Arc::new(CollectSink::default());
        let mut rp = RequestProcessor::new(store(), Arc::clone(&sink) as _).unwrap();
        let session = rp.session_start(sid(4), Datastore::Running).unwrap();

        for _ in 0..8 {
            rp.process(&session, Msg::Request(Request::ListSchemas))
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || sink.sent.lock().len() == 8));
        // Workers drain, spin at most their bounded limit, and sleep.
        assert!(wait_until(Duration::from_secs(5), || {
            rp.inner.queue.lock().active_threads == 0
        }));
        rp.shutdown();
    }
}
