//! Type-erased continuation tasks.
//!
//! A future cell stores its continuation in a single atomic word, so every
//! continuation must be reachable through a thin pointer. `RawTask` is a
//! one-word header embedded as the *first* field of each concrete task
//! (`#[repr(C)]`); invoking goes through the stored function pointer, which
//! casts the header pointer back to the concrete type.
//!
//! Lifetime contract: whoever installs a task keeps it alive until it has
//! been invoked or provably never will be. Tasks typically live on a stack
//! frame that stays parked (a suspended coroutine, or a thread blocked on a
//! condition variable) for exactly that long.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Header of a type-erased continuation. Always the first field of the
/// concrete task so the header pointer and the task pointer coincide.
#[repr(C)]
pub struct RawTask {
    call: unsafe fn(*const RawTask),
}

impl RawTask {
    pub const fn new(call: unsafe fn(*const RawTask)) -> Self {
        Self { call }
    }

    /// Invoke the task behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must point at the `RawTask` header of a live concrete task,
    /// and the task must not have been invoked before.
    pub unsafe fn invoke(ptr: *const RawTask) {
        ((*ptr).call)(ptr)
    }
}

/// A task pointer that can be moved into a posted closure.
///
/// The runtime guarantees the pointee outlives the post: the installing
/// side stays parked until the task fires.
pub(crate) struct SendTaskPtr(pub *const RawTask);

unsafe impl Send for SendTaskPtr {}

/// Continuation that wakes a blocked thread: the "plain thread" flavor of
/// waiting on a cell. Used by `FutureCell::wait` and friends.
#[repr(C)]
pub struct CondvarTask {
    raw: RawTask,
    ready: Mutex<bool>,
    cond: Condvar,
}

impl CondvarTask {
    pub fn new() -> Self {
        Self {
            raw: RawTask::new(Self::wake),
            ready: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn as_task(&self) -> *const RawTask {
        &self.raw
    }

    unsafe fn wake(ptr: *const RawTask) {
        let this = &*(ptr as *const CondvarTask);
        // Notify while the lock is held: the instant the waiter can observe
        // the flag it may return and pop the task's stack frame, so no
        // access is allowed once the guard drops.
        let mut ready = this.ready.lock().unwrap();
        *ready = true;
        this.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut ready = self.ready.lock().unwrap();
        while !*ready {
            ready = self.cond.wait(ready).unwrap();
        }
    }

    /// Returns false if the timeout elapsed before the task fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let ready = self.ready.lock().unwrap();
        let (ready, res) = self
            .cond
            .wait_timeout_while(ready, timeout, |fired| !*fired)
            .unwrap();
        drop(ready);
        !res.timed_out()
    }
}

impl Default for CondvarTask {
    fn default() -> Self {
        Self::new()
    }
}
