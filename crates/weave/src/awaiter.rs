//! The generic await framework.
//!
//! [`await_on`] turns anything that implements [`IntoAwaitable`] into
//! either a coroutine suspension (called inside a routine) or a
//! synchronous blocking wait (called on a plain thread). Every suspension
//! in the runtime goes through here; there are no implicit suspension
//! points.

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::cell::FutureCell;
use crate::reactor::Reactor;
use crate::routine::{
    current_raw, leave, MultiRunner, RawPostLeave, RawRoutine, Routine, Runner, DONE,
};
use crate::task::{RawTask, SendTaskPtr};

/// What an awaitable's registration hook receives: a type-erased task to
/// install wherever the wake will come from, plus the identity of the
/// routine being suspended.
pub struct WaitHandle<'a> {
    task: *const RawTask,
    routine: *const RawRoutine,
    pub(crate) kind: WaitKind<'a>,
}

pub(crate) enum WaitKind<'a> {
    /// Ordinary single await; routine-to-routine handoff may install a
    /// direct continuation.
    Single(&'a Runner),
    /// Part of an `await_all` countdown; only the task may be installed.
    Multi,
}

impl WaitHandle<'_> {
    /// The task to invoke when the awaited event fires. Valid until the
    /// registering routine resumes.
    pub fn task(&self) -> *const RawTask {
        self.task
    }

    /// The reactor the suspending routine is bound to: the executor for
    /// any posting the awaitable needs.
    pub fn reactor(&self) -> Arc<Reactor> {
        unsafe { (*self.routine).reactor.clone() }
    }
}

/// One suspension's view of an awaited value.
///
/// Hooks mirror the cell contract: `ready` never blocks, `register`
/// installs the waiter (false means the value arrived during the attempt
/// and the caller must not park), `take` consumes. `take_blocking` is the
/// plain-thread fallback; awaitables without a synchronous form keep the
/// panicking default.
pub trait Awaitable {
    type Output;

    fn ready(&mut self) -> bool;
    fn register(&mut self, waiter: &WaitHandle<'_>) -> bool;
    fn take(&mut self) -> Self::Output;

    fn take_blocking(&mut self) -> Self::Output {
        panic!("this awaitable can only be awaited inside a routine");
    }
}

pub trait IntoAwaitable {
    type Awaiter: Awaitable;
    fn into_awaitable(self) -> Self::Awaiter;
}

impl<A: Awaitable> IntoAwaitable for A {
    type Awaiter = A;
    fn into_awaitable(self) -> A {
        self
    }
}

// =============================================================================
// await_on
// =============================================================================

#[repr(C)]
struct AwaitRecord<Aw> {
    raw: RawPostLeave,
    runner: Runner,
    awaiter: *mut Aw,
}

unsafe fn await_record_invoke<Aw: Awaitable>(record: *mut RawPostLeave) -> bool {
    let record = record as *mut AwaitRecord<Aw>;
    let handle = WaitHandle {
        task: (*record).runner.as_task(),
        routine: (*record).runner.caller_hint(),
        kind: WaitKind::Single(&(*record).runner),
    };
    (*(*record).awaiter).register(&handle)
}

/// Suspend until `awaitable` is ready and consume its value.
///
/// Inside a routine this parks the routine's stack and frees the worker
/// thread; on a plain thread it falls back to the awaitable's synchronous
/// wait. If the value is already available no suspension happens at all.
pub fn await_on<A: IntoAwaitable>(awaitable: A) -> <A::Awaiter as Awaitable>::Output {
    let mut awaiter = awaitable.into_awaitable();
    if awaiter.ready() {
        return awaiter.take();
    }
    let current = current_raw();
    if current.is_null() {
        return awaiter.take_blocking();
    }
    let mut record = AwaitRecord {
        raw: RawPostLeave {
            call: await_record_invoke::<A::Awaiter>,
        },
        runner: Runner::new(current),
        awaiter: &mut awaiter,
    };
    // The record lives on this routine's stack, which stays parked until
    // the runner fires; registration happens on the resumer's stack after
    // we yield.
    unsafe { leave(current, &mut record.raw as *mut RawPostLeave) };
    awaiter.take()
}

// =============================================================================
// await_all
// =============================================================================

#[repr(C)]
struct MultiAwaitRecord<Aw> {
    raw: RawPostLeave,
    runner: MultiRunner,
    awaiters: *mut Vec<Aw>,
}

unsafe fn multi_record_invoke<Aw: Awaitable>(record: *mut RawPostLeave) -> bool {
    let record = record as *mut MultiAwaitRecord<Aw>;
    let runner = &(*record).runner;
    for awaiter in (*(*record).awaiters).iter_mut() {
        let handle = WaitHandle {
            task: runner.as_task(),
            routine: runner.caller_hint(),
            kind: WaitKind::Multi,
        };
        if awaiter.ready() || !awaiter.register(&handle) {
            runner.complete_one();
        }
    }
    runner.finish_registration()
}

/// Await every element and return the outputs in order, suspending at most
/// once: the caller resumes after the last completion.
pub fn await_all<A: IntoAwaitable>(
    awaitables: Vec<A>,
) -> Vec<<A::Awaiter as Awaitable>::Output> {
    let mut awaiters: Vec<A::Awaiter> = awaitables
        .into_iter()
        .map(IntoAwaitable::into_awaitable)
        .collect();
    let current = current_raw();
    if current.is_null() {
        return awaiters
            .iter_mut()
            .map(|a| if a.ready() { a.take() } else { a.take_blocking() })
            .collect();
    }
    if !awaiters.is_empty() {
        let mut record = MultiAwaitRecord {
            raw: RawPostLeave {
                call: multi_record_invoke::<A::Awaiter>,
            },
            runner: MultiRunner::new(current, awaiters.len()),
            awaiters: &mut awaiters,
        };
        unsafe { leave(current, &mut record.raw as *mut RawPostLeave) };
    }
    awaiters.into_iter().map(|mut a| a.take()).collect()
}

// =============================================================================
// Cell and future awaiters
// =============================================================================

pub struct CellAwaiter<'a, T> {
    cell: &'a FutureCell<T>,
}

impl<'a, T: Send> IntoAwaitable for &'a FutureCell<T> {
    type Awaiter = CellAwaiter<'a, T>;
    fn into_awaitable(self) -> CellAwaiter<'a, T> {
        CellAwaiter { cell: self }
    }
}

impl<T: Send> Awaitable for CellAwaiter<'_, T> {
    type Output = T;

    fn ready(&mut self) -> bool {
        self.cell.is_ready()
    }

    fn register(&mut self, waiter: &WaitHandle<'_>) -> bool {
        self.cell.try_install(waiter.task())
    }

    fn take(&mut self) -> T {
        self.cell.take()
    }

    fn take_blocking(&mut self) -> T {
        self.cell.get_blocking()
    }
}

// =============================================================================
// Routine awaiter: the full handoff
// =============================================================================

pub struct RoutineAwaiter<'a, T: Send + 'static> {
    routine: &'a Routine<T>,
}

impl<'a, T: Send + 'static> IntoAwaitable for &'a Routine<T> {
    type Awaiter = RoutineAwaiter<'a, T>;
    fn into_awaitable(self) -> RoutineAwaiter<'a, T> {
        RoutineAwaiter { routine: self }
    }
}

impl<T: Send + 'static> Awaitable for RoutineAwaiter<'_, T> {
    type Output = T;

    fn ready(&mut self) -> bool {
        self.routine.core().result.is_ready()
    }

    fn register(&mut self, waiter: &WaitHandle<'_>) -> bool {
        let core = self.routine.core();
        let runner = match waiter.kind {
            WaitKind::Single(runner) => runner,
            // Under a countdown the direct-continuation channel stays
            // unused; the completion fires the countdown task like any
            // other cell waiter.
            WaitKind::Multi => return core.result.try_install(waiter.task()),
        };
        let raw = core.raw();
        let caller = runner.caller.swap(ptr::null_mut(), Ordering::SeqCst);
        if !core.result.try_install(runner.as_task()) {
            // Finished before we could register; consume inline.
            return false;
        }
        unsafe {
            match (*raw).continuation.compare_exchange(
                ptr::null_mut(),
                caller,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => true,
                Err(observed) => {
                    debug_assert_eq!(observed, DONE);
                    // Completion slipped in between the install and the
                    // swap and invoked the runner with an empty caller
                    // slot. Wait for its consumption signal, then resume
                    // in place.
                    while runner.caller.load(Ordering::Acquire) != DONE {
                        std::hint::spin_loop();
                    }
                    false
                }
            }
        }
    }

    fn take(&mut self) -> T {
        self.routine.core().result.take()
    }

    fn take_blocking(&mut self) -> T {
        self.routine.core().result.get_blocking()
    }
}

// =============================================================================
// Timer awaiter
// =============================================================================

/// Awaitable duration: `await_on(sleep_for(d))` parks the routine and
/// resumes it from the reactor's timer, usually on another worker.
pub fn sleep_for(duration: Duration) -> SleepFor {
    SleepFor {
        duration,
        reactor: None,
    }
}

/// Like [`sleep_for`], pinned to a specific reactor.
pub fn sleep_for_on(reactor: Arc<Reactor>, duration: Duration) -> SleepFor {
    SleepFor {
        duration,
        reactor: Some(reactor),
    }
}

pub struct SleepFor {
    duration: Duration,
    reactor: Option<Arc<Reactor>>,
}

impl Awaitable for SleepFor {
    type Output = ();

    fn ready(&mut self) -> bool {
        false
    }

    fn register(&mut self, waiter: &WaitHandle<'_>) -> bool {
        let reactor = self.reactor.clone().unwrap_or_else(|| waiter.reactor());
        let task = SendTaskPtr(waiter.task());
        reactor.schedule(self.duration, move || {
            let task = task;
            unsafe { RawTask::invoke(task.0) };
        });
        true
    }

    fn take(&mut self) {}

    fn take_blocking(&mut self) {
        std::thread::sleep(self.duration);
    }
}

impl IntoAwaitable for Duration {
    type Awaiter = SleepFor;
    fn into_awaitable(self) -> SleepFor {
        sleep_for(self)
    }
}

// =============================================================================
// Reactor awaiter
// =============================================================================

/// Awaiting a reactor reschedules the routine through `post`: it resumes
/// on whichever worker picks the task up.
pub struct Reschedule {
    reactor: Arc<Reactor>,
}

impl IntoAwaitable for &Arc<Reactor> {
    type Awaiter = Reschedule;
    fn into_awaitable(self) -> Reschedule {
        Reschedule {
            reactor: self.clone(),
        }
    }
}

impl Awaitable for Reschedule {
    type Output = ();

    fn ready(&mut self) -> bool {
        false
    }

    fn register(&mut self, waiter: &WaitHandle<'_>) -> bool {
        let task = SendTaskPtr(waiter.task());
        self.reactor.post(move || {
            let task = task;
            unsafe { RawTask::invoke(task.0) };
        });
        true
    }

    fn take(&mut self) {}
}

// =============================================================================
// Escaping the coroutine
// =============================================================================

/// Run `f` outside of any routine.
///
/// On a plain thread this is a direct call. Inside a routine, `f` is
/// posted to the routine's reactor and awaited, so code that blocks the
/// OS thread (FFI, synchronous IO) does not pin this routine's stack to a
/// worker.
pub fn run_outside_of_routine<F, R>(f: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if current_raw().is_null() {
        return f();
    }
    let reactor = Routine::<()>::current_reactor().expect("routine without a reactor");
    let cell = Arc::new(FutureCell::new());
    let publish = cell.clone();
    reactor.post(move || {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(value) => publish.set_value(value),
            Err(payload) => publish.set_panic(payload),
        }
    });
    await_on(&*cell)
}
