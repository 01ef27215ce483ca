//! Task executor and timer service backing the runtime.
//!
//! The rest of the crate only needs two operations from a reactor:
//! `post(job)` and a one-shot timer. Jobs land on a lock-free injector
//! queue; parked workers are woken through a mutex/condvar pair (posting
//! notifies under the lock so a worker checking the queue cannot miss it).
//!
//! `run()` has `io_context::run` semantics: it returns once the reactor is
//! stopped, or once no [`WorkGuard`] is held and there is no queued or
//! scheduled work left. Parked coroutines are not reactor work; whoever
//! wants workers to stick around holds a guard.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;

use crate::wv_debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    job: Job,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap; invert so the earliest deadline pops first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cancellation handle for a scheduled timer. Cancelling is advisory: a
/// timer that already fired is unaffected.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

pub struct Reactor {
    injector: SegQueue<Job>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    timer_seq: AtomicU64,
    park: Mutex<()>,
    wakeup: Condvar,
    stopped: AtomicBool,
    guards: AtomicUsize,
    routines: AtomicUsize,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            injector: SegQueue::new(),
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            park: Mutex::new(()),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
            guards: AtomicUsize::new(0),
            routines: AtomicUsize::new(0),
        }
    }

    /// Enqueue a job for execution on some worker thread.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        self.injector.push(Box::new(job));
        let _guard = self.park.lock().unwrap();
        self.wakeup.notify_one();
    }

    /// Arm a one-shot timer firing `job` after `delay` on some worker.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: cancelled.clone(),
            job: Box::new(job),
        };
        self.timers.lock().unwrap().push(entry);
        let _guard = self.park.lock().unwrap();
        self.wakeup.notify_one();
        TimerHandle { cancelled }
    }

    /// Pop every due, non-cancelled timer and report the next deadline.
    fn collect_due(&self) -> (Vec<Job>, Option<Instant>) {
        let mut due = Vec::new();
        let mut timers = self.timers.lock().unwrap();
        let now = Instant::now();
        while let Some(head) = timers.peek() {
            if head.cancelled.load(Ordering::Acquire) {
                timers.pop();
                continue;
            }
            if head.deadline > now {
                break;
            }
            due.push(timers.pop().unwrap().job);
        }
        let next = timers.peek().map(|e| e.deadline);
        (due, next)
    }

    /// Worker loop. Call from as many threads as desired.
    pub fn run(&self) {
        wv_debug!("worker started");
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if let Some(job) = self.injector.pop() {
                job();
                continue;
            }
            let (due, next) = self.collect_due();
            if !due.is_empty() {
                for job in due {
                    job();
                }
                continue;
            }
            if self.guards.load(Ordering::Acquire) == 0 && self.injector.is_empty() && next.is_none()
            {
                break;
            }
            let guard = self.park.lock().unwrap();
            if self.stopped.load(Ordering::Acquire) || !self.injector.is_empty() {
                continue;
            }
            // Recompute the deadline under the park lock: a timer scheduled
            // after collect_due would have notified before we wait, and the
            // notification would be lost. (Cancelled heads at worst wake us
            // early.)
            let next = self.timers.lock().unwrap().peek().map(|e| e.deadline);
            match next {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    let _ = self.wakeup.wait_timeout(guard, timeout).unwrap();
                }
                None => {
                    let _guard = self.wakeup.wait(guard).unwrap();
                }
            }
        }
        wv_debug!("worker exiting");
    }

    /// Ask workers to return as soon as possible.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _guard = self.park.lock().unwrap();
        self.wakeup.notify_all();
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Clear the stopped flag so `run` can be called again.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Keep `run` from returning while held, even with no queued work.
    pub fn guard(self: &Arc<Self>) -> WorkGuard {
        self.guards.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            reactor: self.clone(),
        }
    }

    /// Number of routines bound to this reactor that have not finished.
    /// Debug aid; see the detached-cleanup tests.
    pub fn live_routines(&self) -> usize {
        self.routines.load(Ordering::Acquire)
    }

    pub(crate) fn routine_started(&self) {
        self.routines.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn routine_finished(&self) {
        self.routines.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle that keeps `Reactor::run` from returning.
pub struct WorkGuard {
    reactor: Arc<Reactor>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.reactor.guards.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.reactor.park.lock().unwrap();
        self.reactor.wakeup.notify_all();
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// N worker threads running a reactor, holding a work guard until dropped
/// or explicitly joined.
pub struct WorkerPool {
    guard: Option<WorkGuard>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(count: usize) -> Self {
        Self::with_reactor(count, default_reactor())
    }

    pub fn with_reactor(count: usize, reactor: Arc<Reactor>) -> Self {
        if reactor.stopped() {
            reactor.reset();
        }
        let guard = reactor.guard();
        let threads = (0..count)
            .map(|i| {
                let reactor = reactor.clone();
                thread::Builder::new()
                    .name(format!("weave-worker-{i}"))
                    .spawn(move || reactor.run())
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self {
            guard: Some(guard),
            threads,
        }
    }

    /// Size the pool as a percentage of the machine's hardware threads,
    /// with a floor of one worker.
    pub fn with_hardware_share(percent: f64) -> Self {
        let hw = thread::available_parallelism().map_or(1, |n| n.get());
        let count = ((hw as f64 * percent / 100.0) as usize).max(1);
        Self::new(count)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Release the work guard and wait for every worker to return.
    pub fn join_all(&mut self) {
        self.guard.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

// =============================================================================
// Default reactor
// =============================================================================

type Provider = Box<dyn Fn() -> Arc<Reactor> + Send + Sync>;

static PROVIDER: Mutex<Option<Provider>> = Mutex::new(None);
static DEFAULT: OnceLock<Arc<Reactor>> = OnceLock::new();

/// Override where [`default_reactor`] resolves to, process-wide.
pub fn set_default_reactor(provider: impl Fn() -> Arc<Reactor> + Send + Sync + 'static) {
    *PROVIDER.lock().unwrap() = Some(Box::new(provider));
}

/// The reactor used when none is passed explicitly.
pub fn default_reactor() -> Arc<Reactor> {
    if let Some(provider) = &*PROVIDER.lock().unwrap() {
        return provider();
    }
    DEFAULT.get_or_init(|| Arc::new(Reactor::new())).clone()
}
