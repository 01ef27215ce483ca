//! Stackful coroutines and the continuation handoff protocol.
//!
//! A [`Routine`] runs a closure on its own stack, bound to a reactor. It
//! starts executing on the constructing thread and runs until the closure
//! either finishes or suspends inside [`crate::await_on`]; afterwards it is
//! resumed by whoever fires the armed continuation, possibly on a
//! different worker thread. One thread executes a routine at any instant.
//!
//! # The handoff
//!
//! Two atomic words coordinate a routine A awaiting a routine B:
//!
//! - B's result cell continuation (see [`crate::cell`]) holds A's
//!   [`Runner`] task once installed.
//! - B's `continuation` word holds A itself: null (nothing installed), a
//!   routine pointer (a parked awaiter), or the `DONE` sentinel
//!   (completion has passed, installs are refused).
//!
//! When B finishes, its resume loop first swaps `continuation` to `DONE`
//! (recovering a fully parked awaiter, which it returns to its caller for
//! chain-resumption) and only then publishes the result, which fires any
//! runner still registered on the cell. An awaiter that loses the install
//! race observes `DONE`, waits for the runner's consumption signal, and
//! continues inline. Exactly one side resumes A.
//!
//! # Post-leave tasks
//!
//! A routine cannot arm its own continuation while still running on its
//! stack: the waker could fire and resume it before the stack is parked.
//! Instead, suspension arms a *post-leave* record and yields; the resume
//! loop runs the record on the outer stack, after the routine's stack is
//! safely parked. Completion reuses the same slot for the result setter so
//! the value becomes visible only once the stack can no longer be touched.

use std::any::Any;
use std::cell::{Cell, UnsafeCell};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use generator::{Generator, Gn};

use crate::cell::FutureCell;
use crate::reactor::{default_reactor, Reactor};
use crate::task::RawTask;
use crate::wv_debug;

/// Default stack size for a routine, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Sentinel for `RawRoutine::continuation` and `Runner::caller`:
/// completion has passed, do not install.
pub(crate) const DONE: *mut RawRoutine = 1 as *mut RawRoutine;

thread_local! {
    static CURRENT: Cell<*const RawRoutine> = const { Cell::new(ptr::null()) };
}

pub(crate) fn current_raw() -> *const RawRoutine {
    CURRENT.with(|c| c.get())
}

type ResumeFn = unsafe fn(*const RawRoutine) -> *const RawRoutine;

/// Non-generic header embedded at offset zero of every `RoutineCore<T>`.
/// The handoff machinery, the await framework, and local storage work
/// exclusively through this view.
#[repr(C)]
pub(crate) struct RawRoutine {
    resume: ResumeFn,
    pub(crate) continuation: AtomicPtr<RawRoutine>,
    post_leave: AtomicPtr<RawPostLeave>,
    detached: AtomicBool,
    outer: Cell<*const RawRoutine>,
    pub(crate) reactor: Arc<Reactor>,
    pub(crate) locals: UnsafeCell<HashMap<usize, Box<dyn Any + Send>>>,
}

impl RawRoutine {
    /// Drive the routine until it suspends or finishes. Returns the
    /// awaiter recovered at completion (to be chain-resumed), or null.
    ///
    /// # Safety
    /// `ptr` must point at a live routine core that is currently parked,
    /// and the caller must hold the sole right to execute it.
    pub(crate) unsafe fn resume(ptr: *const RawRoutine) -> *const RawRoutine {
        ((*ptr).resume)(ptr)
    }
}

/// Header of a type-erased post-leave record; first field of the concrete
/// record. Returns false if the suspension was abandoned and the routine
/// must be resumed immediately.
#[repr(C)]
pub(crate) struct RawPostLeave {
    pub(crate) call: unsafe fn(*mut RawPostLeave) -> bool,
}

// The raw header must sit at offset zero: resume and the handoff pass
// `*const RawRoutine` around and cast back to the concrete core.
#[repr(C)]
pub(crate) struct RoutineCore<T> {
    raw: RawRoutine,
    pub(crate) result: FutureCell<T>,
    staging: UnsafeCell<Option<std::thread::Result<T>>>,
    setter: SetterRecord,
    gen: UnsafeCell<Option<Generator<'static, (), ()>>>,
}

// A routine core is shared between threads but executed by one thread at a
// time; cross-thread state is confined to the atomics and the result cell,
// and the generator/staging/locals are only touched by the executing
// thread.
unsafe impl<T: Send> Send for RoutineCore<T> {}
unsafe impl<T: Send> Sync for RoutineCore<T> {}

impl<T> RoutineCore<T> {
    pub(crate) fn raw(&self) -> *const RawRoutine {
        &self.raw as *const RawRoutine
    }
}

/// The result setter, armed as the post-leave record when the body
/// finishes. Publishing from here (outer stack, routine stack parked)
/// means a joiner can free the routine the moment the value is visible.
#[repr(C)]
struct SetterRecord {
    raw: RawPostLeave,
    core: Cell<*const ()>,
}

struct SendPtr<P>(P);
unsafe impl<P> Send for SendPtr<P> {}

// =============================================================================
// Handle
// =============================================================================

/// Owning handle to a stackful coroutine.
///
/// The closure starts running inside the constructor and keeps the
/// caller's thread until it first suspends. The handle must be consumed by
/// [`join`](Routine::join), [`detach`](Routine::detach), or
/// [`crate::await_on`] before drop unless the routine already finished;
/// dropping a live, non-detached routine aborts the process.
pub struct Routine<T: Send + 'static = ()> {
    core: Option<Arc<RoutineCore<T>>>,
}

impl<T: Send + 'static> Routine<T> {
    /// Run `f` as a routine on the default reactor.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::with_reactor(default_reactor(), f)
    }

    pub fn with_reactor<F>(reactor: Arc<Reactor>, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self::with_stack_size(reactor, DEFAULT_STACK_SIZE, f)
    }

    pub fn with_stack_size<F>(reactor: Arc<Reactor>, stack_size: usize, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        reactor.routine_started();
        let core = Arc::new(RoutineCore {
            raw: RawRoutine {
                resume: resume_raw::<T>,
                continuation: AtomicPtr::new(ptr::null_mut()),
                post_leave: AtomicPtr::new(ptr::null_mut()),
                detached: AtomicBool::new(false),
                outer: Cell::new(ptr::null()),
                reactor,
                locals: UnsafeCell::new(HashMap::new()),
            },
            result: FutureCell::new(),
            staging: UnsafeCell::new(None),
            setter: SetterRecord {
                raw: RawPostLeave {
                    call: run_setter::<T>,
                },
                core: Cell::new(ptr::null()),
            },
            gen: UnsafeCell::new(None),
        });
        core.setter.core.set(Arc::as_ptr(&core) as *const ());

        let body = SendPtr(Arc::as_ptr(&core));
        let gen = Gn::<()>::new_scoped_opt(stack_size, move |_scope| {
            let core = body;
            unsafe { routine_body(core.0, f) }
        });
        unsafe {
            *core.gen.get() = Some(gen);
            let _ = RawRoutine::resume(core.raw());
        }
        debug_assert!(current_raw() != core.raw());
        Routine { core: Some(core) }
    }

    /// Block the calling thread until the routine finishes, then return
    /// its result, re-raising a panic from the body.
    pub fn join(mut self) -> T {
        let core = self.core.take().expect("routine already consumed");
        core.result.get_blocking()
    }

    /// Release the handle; the routine cleans itself up on completion.
    pub fn detach(mut self) {
        let core = self.core.take().expect("routine already consumed");
        wv_debug!("routine detached");
        if core
            .raw
            .detached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Completion has not passed yet: leak our reference, the
            // result setter reclaims and frees it.
            let _ = Arc::into_raw(core);
        }
        // Otherwise the routine already finished; dropping the Arc frees
        // it here.
    }

    pub fn is_ready(&self) -> bool {
        self.core().result.is_ready()
    }

    /// The reactor this routine posts through.
    pub fn reactor(&self) -> Arc<Reactor> {
        self.core().raw.reactor.clone()
    }

    pub(crate) fn core(&self) -> &RoutineCore<T> {
        self.core.as_ref().expect("routine already consumed")
    }

    /// Identity of the innermost routine running on this thread, if any.
    pub fn current() -> Option<RoutineId> {
        let ptr = current_raw();
        (!ptr.is_null()).then_some(RoutineId(ptr as usize))
    }

    /// Reactor of the innermost routine running on this thread.
    pub fn current_reactor() -> Option<Arc<Reactor>> {
        let ptr = current_raw();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { (*ptr).reactor.clone() })
        }
    }
}

impl<T: Send + 'static> Drop for Routine<T> {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            if !core.result.is_ready() {
                // Mirrors dropping a running std::thread pre-joined: there
                // is no safe way to tear down a parked stack that other
                // threads may still resume.
                eprintln!("weave: routine dropped while still running; aborting");
                std::process::abort();
            }
        }
    }
}

/// Opaque identity of a routine, comparable and copyable.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RoutineId(usize);

// =============================================================================
// Body, resume loop, post-leave
// =============================================================================

unsafe fn routine_body<T, F: FnOnce() -> T>(core: *const RoutineCore<T>, f: F) {
    let raw = core as *const RawRoutine;
    // Entered through resume_raw: CURRENT already points at this routine.
    let result = catch_unwind(AssertUnwindSafe(f));
    *(*core).staging.get() = Some(result);
    let prev = (*raw).post_leave.swap(
        &(*core).setter.raw as *const RawPostLeave as *mut RawPostLeave,
        Ordering::Release,
    );
    debug_assert!(prev.is_null());
    // Restore the thread's current pointer before the stack winds down.
    CURRENT.with(|c| c.set((*raw).outer.get()));
}

unsafe fn resume_raw<T>(raw: *const RawRoutine) -> *const RawRoutine {
    let core = raw as *const RoutineCore<T>;
    loop {
        let prev = CURRENT.with(|c| c.replace(raw));
        (*raw).outer.set(prev);

        let finished = {
            let gen = (*(*core).gen.get())
                .as_mut()
                .expect("routine resumed before its stack was set up");
            let _ = gen.resume();
            gen.is_done()
        };

        if finished {
            // Refuse further installs and recover a parked awaiter before
            // the value becomes visible; a racing await observes DONE.
            let awaiter = (*raw).continuation.swap(DONE, Ordering::AcqRel);
            debug_assert!(awaiter != DONE);
            // Runs the result setter. May free the core (detached), so no
            // access past this point.
            let armed = run_post_leave(raw);
            debug_assert!(armed, "routine finished without arming its result setter");
            return awaiter;
        }

        if run_post_leave(raw) {
            return ptr::null();
        }
        // The suspension was abandoned (the awaited value arrived during
        // registration): fall through and resume the routine in place.
    }
}

/// Swap out and run the armed post-leave record, if any. Returns false if
/// the record asks for an immediate resume.
unsafe fn run_post_leave(raw: *const RawRoutine) -> bool {
    let record = (*raw).post_leave.swap(ptr::null_mut(), Ordering::SeqCst);
    if record.is_null() {
        return true;
    }
    ((*record).call)(record)
}

unsafe fn run_setter<T>(record: *mut RawPostLeave) -> bool {
    let setter = record as *const SetterRecord;
    let core = (*setter).core.get() as *const RoutineCore<T>;
    let raw = core as *const RawRoutine;

    // Normally resume_raw already swapped in the sentinel; this covers the
    // setter running before any awaiter could have been installed.
    let _ = (*raw).continuation.compare_exchange(
        ptr::null_mut(),
        DONE,
        Ordering::Relaxed,
        Ordering::Relaxed,
    );

    let result = (*(*core).staging.get())
        .take()
        .expect("routine finished without a result");

    (*raw).reactor.routine_finished();

    // Exactly one of {detach, completion} wins this flag; the loser of the
    // race owns freeing the allocation.
    let completion_first = (*raw)
        .detached
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();

    match result {
        Ok(value) => (*core).result.set_value(value),
        Err(payload) => (*core).result.set_panic(payload),
    }

    if !completion_first {
        // detach() ran earlier and leaked its reference; reclaim and free.
        drop(Arc::from_raw(core));
    }
    true
}

/// Arm `record` and yield the current routine's stack back to its resumer.
///
/// # Safety
/// Must be called on the thread currently executing `raw`, with `record`
/// pointing at a post-leave record that stays valid until the routine is
/// resumed.
pub(crate) unsafe fn leave(raw: *const RawRoutine, record: *mut RawPostLeave) {
    let prev = (*raw).post_leave.swap(record, Ordering::SeqCst);
    debug_assert!(prev.is_null(), "routine suspended with a pending post-leave");
    CURRENT.with(|c| c.set((*raw).outer.get()));
    generator::yield_with(());
    // Resumed: resume_raw has re-installed CURRENT for us.
}

// =============================================================================
// Runners
// =============================================================================

/// The task that owns "resume the caller" for one suspension. Lives in the
/// await record on the caller's parked stack.
#[repr(C)]
pub(crate) struct Runner {
    raw: RawTask,
    pub(crate) caller: AtomicPtr<RawRoutine>,
}

impl Runner {
    pub(crate) fn new(caller: *const RawRoutine) -> Self {
        Self {
            raw: RawTask::new(runner_invoke),
            caller: AtomicPtr::new(caller as *mut RawRoutine),
        }
    }

    pub(crate) fn as_task(&self) -> *const RawTask {
        &self.raw
    }

    /// The caller as of registration time; only meaningful before any
    /// swap on the slot.
    pub(crate) fn caller_hint(&self) -> *const RawRoutine {
        self.caller.load(Ordering::Relaxed)
    }
}

unsafe fn runner_invoke(task: *const RawTask) {
    let runner = task as *const Runner;
    let caller = (*runner).caller.swap(DONE, Ordering::AcqRel);
    // A racing await observes DONE and reclaims the record; the runner
    // must not be touched past the swap.
    resume_chain(caller);
}

/// Countdown variant: resumes the caller once `remaining` reaches zero.
/// Backs [`crate::await_all`].
#[repr(C)]
pub(crate) struct MultiRunner {
    raw: RawTask,
    caller: AtomicPtr<RawRoutine>,
    remaining: AtomicUsize,
}

impl MultiRunner {
    /// `count` pending completions plus one registration step.
    pub(crate) fn new(caller: *const RawRoutine, count: usize) -> Self {
        Self {
            raw: RawTask::new(multi_runner_invoke),
            caller: AtomicPtr::new(caller as *mut RawRoutine),
            remaining: AtomicUsize::new(count + 1),
        }
    }

    pub(crate) fn as_task(&self) -> *const RawTask {
        &self.raw
    }

    /// The caller as of registration time.
    pub(crate) fn caller_hint(&self) -> *const RawRoutine {
        self.caller.load(Ordering::Relaxed)
    }

    /// Account one awaitable that was already complete at registration.
    pub(crate) fn complete_one(&self) {
        let prev = self.remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 1, "registration decrements cannot exhaust the count");
    }

    /// Drop the registration step. Returns false if everything already
    /// completed and the caller should continue inline.
    pub(crate) fn finish_registration(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) != 1
    }
}

unsafe fn multi_runner_invoke(task: *const RawTask) {
    let runner = task as *const MultiRunner;
    if (*runner).remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    let caller = (*runner).caller.swap(DONE, Ordering::AcqRel);
    resume_chain(caller);
}

/// Resume `routine` and keep resuming whatever each completion hands back.
///
/// If this thread is already inside a routine, resuming here would nest a
/// second parked stack on top of the running one; bounce through the
/// target's reactor instead.
pub(crate) unsafe fn resume_chain(routine: *mut RawRoutine) {
    if routine.is_null() || routine == DONE {
        return;
    }
    if !current_raw().is_null() {
        let target = SendPtr(routine);
        (*routine).reactor.post(move || {
            let target = target;
            unsafe { resume_chain(target.0) };
        });
        return;
    }
    let mut next = routine as *const RawRoutine;
    while !next.is_null() && next != DONE as *const RawRoutine {
        next = RawRoutine::resume(next);
    }
}
