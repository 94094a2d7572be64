//! Async operation plumbing: one-shot completions, per-image FIFO work
//! queues, a concurrency throttle for fan-out maintenance ops, and the
//! invoke-async-request envelope shared by every mutating admin operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use blockio_common::{Error, Result};

use crate::exclusive_lock;
use crate::image::{ImageCtx, OwnerState};

// ── one-shot completion ───────────────────────────────────────────────────

#[derive(Default)]
struct CompletionState {
    done: bool,
    result: Option<Result<()>>,
    data: Option<Bytes>,
}

/// One-shot condition a blocking caller parks on while the submitted
/// operation runs elsewhere.
#[derive(Default)]
pub struct OpCompletion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

impl OpCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: Result<()>) {
        let mut state = self.state.lock();
        debug_assert!(!state.done, "completion finished twice");
        state.result = Some(result);
        state.done = true;
        self.cond.notify_all();
    }

    /// Complete successfully and hand back a payload (read results)
    pub fn complete_with_data(&self, data: Bytes) {
        let mut state = self.state.lock();
        debug_assert!(!state.done, "completion finished twice");
        state.data = Some(data);
        state.result = Some(Ok(()));
        state.done = true;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.lock().done
    }

    /// Block until the operation reaches a terminal state
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
        state.result.take().unwrap_or(Ok(()))
    }

    /// Block and return the payload attached by `complete_with_data`
    pub fn wait_for_data(&self) -> Result<Bytes> {
        let mut state = self.state.lock();
        while !state.done {
            self.cond.wait(&mut state);
        }
        match state.result.take() {
            Some(Err(e)) => Err(e),
            _ => Ok(state.data.take().unwrap_or_default()),
        }
    }
}

// ── FIFO work queue ───────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueShared {
    pending: Mutex<usize>,
    idle: Condvar,
}

/// Single-threaded FIFO queue. Data-plane submissions and the flush that
/// follows them retire in submission order, which is what gives
/// `aio_flush` its ordering guarantee.
pub(crate) struct TaskQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(QueueShared {
            pending: Mutex::new(0),
            idle: Condvar::new(),
        });
        let (tx, rx) = mpsc::channel::<Job>();
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("blockio-{name}"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                    let mut pending = worker_shared.pending.lock();
                    *pending -= 1;
                    if *pending == 0 {
                        worker_shared.idle.notify_all();
                    }
                }
            })
            .expect("failed to spawn worker thread");
        Self {
            tx: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            warn!("work queue already shut down; dropping job");
            return;
        };
        *self.shared.pending.lock() += 1;
        // the worker only exits once the sender is dropped
        tx.send(Box::new(job)).expect("worker thread terminated");
    }

    /// Wait until every submitted job has retired
    pub fn drain(&self) {
        let mut pending = self.shared.pending.lock();
        while *pending > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        *self.shared.pending.lock() > 0
    }

    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── concurrency throttle ──────────────────────────────────────────────────

struct ThrottleState {
    inflight: usize,
    error: Option<Error>,
}

/// Bounds in-flight sub-operations of a fan-out request and collects the
/// first failure.
pub(crate) struct Throttle {
    max: usize,
    state: Mutex<ThrottleState>,
    cond: Condvar,
}

impl Throttle {
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            max: max.max(1),
            state: Mutex::new(ThrottleState {
                inflight: 0,
                error: None,
            }),
            cond: Condvar::new(),
        })
    }

    /// Reserve a slot, blocking while the bound is reached
    pub fn start_op(&self) {
        let mut state = self.state.lock();
        while state.inflight >= self.max {
            self.cond.wait(&mut state);
        }
        state.inflight += 1;
    }

    pub fn end_op(&self, result: Result<()>) {
        let mut state = self.state.lock();
        state.inflight -= 1;
        if let Err(e) = result {
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        self.cond.notify_all();
    }

    #[must_use]
    pub fn pending_error(&self) -> bool {
        self.state.lock().error.is_some()
    }

    /// Wait for every started op and surface the first failure
    pub fn wait_for_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.inflight > 0 {
            self.cond.wait(&mut state);
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── async request tracking ────────────────────────────────────────────────

/// Tracks long-running requests for this image so `cancel_async_requests`
/// can signal all of them.
#[derive(Default)]
pub(crate) struct AsyncRequestTracker {
    next: AtomicU64,
    inflight: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl AsyncRequestTracker {
    pub fn register(&self) -> (u64, Arc<AtomicBool>) {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(AtomicBool::new(false));
        self.inflight.lock().insert(id, Arc::clone(&cancel));
        (id, cancel)
    }

    pub fn unregister(&self, id: u64) {
        self.inflight.lock().remove(&id);
    }

    pub fn cancel_all(&self) {
        for cancel in self.inflight.lock().values() {
            cancel.store(true, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.inflight.lock().is_empty()
    }
}

/// Interruption check used inside fan-out loops
pub(crate) fn interrupted(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::SeqCst) {
        Err(Error::Restart)
    } else {
        Ok(())
    }
}

// ── invoke-async-request envelope ─────────────────────────────────────────

/// Local execution body of a mutating admin op. Runs on the op queue with
/// the owner lock read-held and ownership verified.
pub(crate) type LocalRequest =
    Arc<dyn Fn(&Arc<ImageCtx>, &OwnerState, &AtomicBool) -> Result<()> + Send + Sync>;

/// Uniform local-vs-remote dispatcher: become the lock owner and run the
/// op locally, or delegate it to the current owner over the watch channel.
/// RESTART is retried a bounded number of times; remote TIMEOUT loops back
/// into lock acquisition.
pub(crate) fn invoke_async_request(
    ctx: &Arc<ImageCtx>,
    request_type: &'static str,
    permit_snapshot: bool,
    local: LocalRequest,
    remote: &dyn Fn() -> Result<()>,
) -> Result<()> {
    let mut restarts = 0u32;
    loop {
        let completion = OpCompletion::new();
        {
            let mut owner = ctx.owner_lock.read();
            {
                let snap = ctx.snap_lock.read();
                if ctx.read_only || (!permit_snapshot && !snap.at_head()) {
                    return Err(Error::ReadOnly);
                }
            }

            while ctx.lock_supported() && !owner.is_lock_owner() {
                drop(owner);
                if exclusive_lock::prepare_image_update(ctx).is_err() {
                    return Err(Error::ReadOnly);
                }
                owner = ctx.owner_lock.read();
                if owner.is_lock_owner() {
                    break;
                }

                match remote() {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_retryable_remote() => {
                        debug!(request_type, "timed out notifying lock owner");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let (request_id, cancel) = ctx.async_requests.register();
            let job_ctx = Arc::clone(ctx);
            let job_local = Arc::clone(&local);
            let job_completion = Arc::clone(&completion);
            ctx.op_queue.submit(move || {
                let result = (|| {
                    let owner = job_ctx.owner_lock.read();
                    if job_ctx.lock_supported() && !owner.is_lock_owner() {
                        // ownership moved between scheduling and execution
                        return Err(Error::Restart);
                    }
                    job_local(&job_ctx, &owner, &cancel)
                })();
                job_ctx.async_requests.unregister(request_id);
                job_completion.complete(result);
            });
        }

        match completion.wait() {
            Err(Error::Restart) if restarts < ctx.config.max_restart_retries => {
                restarts += 1;
                debug!(request_type, "interrupted: restarting");
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_completion_wait_returns_result() {
        let completion = OpCompletion::new();
        let waiter = Arc::clone(&completion);
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(10));
        completion.complete(Err(Error::ReadOnly));
        assert!(matches!(handle.join().unwrap(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_completion_data() {
        let completion = OpCompletion::new();
        completion.complete_with_data(Bytes::from_static(b"abc"));
        assert_eq!(&completion.wait_for_data().unwrap()[..], b"abc");
    }

    #[test]
    fn test_queue_runs_in_order() {
        let queue = TaskQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            queue.submit(move || log.lock().push(i));
        }
        queue.drain();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
        assert!(!queue.is_busy());
    }

    #[test]
    fn test_throttle_bounds_and_collects_errors() {
        let throttle = Throttle::new(2);
        let peak = Arc::new(Mutex::new((0usize, 0usize))); // (current, max)

        let mut handles = Vec::new();
        for i in 0..8 {
            let throttle = Arc::clone(&throttle);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                throttle.start_op();
                {
                    let mut p = peak.lock();
                    p.0 += 1;
                    p.1 = p.1.max(p.0);
                }
                std::thread::sleep(Duration::from_millis(5));
                peak.lock().0 -= 1;
                let result = if i == 3 {
                    Err(Error::not_found("obj"))
                } else {
                    Ok(())
                };
                throttle.end_op(result);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.lock().1 <= 2);
        assert!(throttle.wait_for_all().unwrap_err().is_not_found());
    }

    #[test]
    fn test_tracker_cancellation() {
        let tracker = AsyncRequestTracker::default();
        let (id, cancel) = tracker.register();
        assert!(tracker.is_busy());
        assert!(interrupted(&cancel).is_ok());

        tracker.cancel_all();
        assert!(matches!(interrupted(&cancel), Err(Error::Restart)));

        tracker.unregister(id);
        assert!(!tracker.is_busy());
    }
}
