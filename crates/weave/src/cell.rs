//! Single-slot lock-free future cell.
//!
//! The cell is the primitive everything else is built from: a value slot
//! plus one atomic continuation word. The word has three states:
//!
//! - null — no waiter registered
//! - a task pointer — exactly one waiter registered
//! - `READY` (the reserved bit pattern `0x1`) — the value is published
//!
//! The word only moves forward: `null -> task` (at most once), then
//! `task -> READY` or `null -> READY`. The swap to `READY` is the
//! linearization point; the value slot is written before it (release) and
//! read only after observing `READY` (acquire).
//!
//! A cell feeds three kinds of consumers through the same word: a parked
//! coroutine (via a `Runner` task), a blocked thread (via a
//! [`CondvarTask`]), or an arbitrary callback.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use crate::task::{CondvarTask, RawTask};

/// Reserved non-pointer value marking a published cell.
pub(crate) const READY: *mut RawTask = 1 as *mut RawTask;

/// A captured panic, carried across the cell and re-raised at the
/// consuming end.
pub type PanicPayload = Box<dyn std::any::Any + Send + 'static>;

enum Slot<T> {
    Unset,
    Value(T),
    Panicked(PanicPayload),
    Taken,
}

pub struct FutureCell<T> {
    continuation: AtomicPtr<RawTask>,
    slot: UnsafeCell<Slot<T>>,
}

// The slot is only written before the READY publish and only read after
// observing READY, with exactly one consumer; the continuation word
// carries the synchronization.
unsafe impl<T: Send> Send for FutureCell<T> {}
unsafe impl<T: Send> Sync for FutureCell<T> {}

impl<T> FutureCell<T> {
    pub fn new() -> Self {
        Self {
            continuation: AtomicPtr::new(ptr::null_mut()),
            slot: UnsafeCell::new(Slot::Unset),
        }
    }

    /// A cell born published, as used by [`crate::ready_future`].
    pub fn ready(value: T) -> Self {
        Self {
            continuation: AtomicPtr::new(READY),
            slot: UnsafeCell::new(Slot::Value(value)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.continuation.load(Ordering::Acquire) == READY
    }

    /// Publish a value. May be called from any thread, exactly once in the
    /// lifetime of the cell; a second set is a programming error.
    pub fn set_value(&self, value: T) {
        unsafe { *self.slot.get() = Slot::Value(value) };
        self.publish();
    }

    /// Publish a captured panic instead of a value.
    pub fn set_panic(&self, payload: PanicPayload) {
        unsafe { *self.slot.get() = Slot::Panicked(payload) };
        self.publish();
    }

    fn publish(&self) {
        let prev = self.continuation.swap(READY, Ordering::AcqRel);
        assert!(prev != READY, "future cell set twice");
        if !prev.is_null() {
            unsafe { RawTask::invoke(prev) };
        }
    }

    /// Install `task` as the sole continuation.
    ///
    /// Returns true if the task now owns the wake: it will be invoked
    /// exactly once when the cell publishes. Returns false if the cell is
    /// already published, in which case the task will never be invoked and
    /// the caller consumes the value directly.
    pub fn try_install(&self, task: *const RawTask) -> bool {
        match self.continuation.compare_exchange(
            ptr::null_mut(),
            task as *mut RawTask,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(observed) => {
                assert!(observed == READY, "future cell suspended twice");
                false
            }
        }
    }

    /// Consume the value, re-raising a captured panic.
    ///
    /// The cell must be ready and the value not yet consumed; there is
    /// exactly one consumer by contract.
    pub fn take(&self) -> T {
        debug_assert!(self.is_ready(), "future cell consumed before it was set");
        match std::mem::replace(unsafe { &mut *self.slot.get() }, Slot::Taken) {
            Slot::Value(value) => value,
            Slot::Panicked(payload) => std::panic::resume_unwind(payload),
            Slot::Taken => panic!("future cell consumed twice"),
            Slot::Unset => unreachable!("future cell published without a value"),
        }
    }

    /// Block the calling thread until the cell publishes. Spins briefly
    /// first; the uncontended-set case never touches a condition variable.
    pub fn wait(&self) {
        for _ in 0..4 {
            if self.is_ready() {
                return;
            }
            std::thread::yield_now();
        }
        let task = CondvarTask::new();
        if self.try_install(task.as_task()) {
            task.wait();
        }
    }

    /// Block until the cell publishes or `timeout` elapses. Returns true
    /// if the cell is ready.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_ready() {
            return true;
        }
        let task = CondvarTask::new();
        if self.try_install(task.as_task()) && !task.wait_for(timeout) {
            // Whoever wins this exchange owns the outcome: we reclaim the
            // waiter, or the setter already took it and a wake is in
            // flight.
            if self
                .continuation
                .compare_exchange(
                    task.as_task() as *mut RawTask,
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return false;
            }
            // Lost the race: the setter holds a pointer to `task` and will
            // fire it. Rendezvous before the frame goes away.
            task.wait();
        }
        true
    }

    pub fn get_blocking(&self) -> T {
        self.wait();
        self.take()
    }

    /// Rearm a consumed cell for reuse.
    ///
    /// # Safety
    /// The caller must guarantee no other thread accesses the cell for the
    /// duration of the reset (the channels enforce this through their
    /// rendezvous protocol).
    pub(crate) unsafe fn reset(&self) {
        *self.slot.get() = Slot::Unset;
        self.continuation.store(ptr::null_mut(), Ordering::Release);
    }

    /// Rearm a consumed cell straight into the published state.
    ///
    /// # Safety
    /// Same exclusivity requirement as [`reset`](Self::reset).
    pub(crate) unsafe fn reset_ready(&self, value: T) {
        *self.slot.get() = Slot::Value(value);
        self.continuation.store(READY, Ordering::Release);
    }
}

impl<T> Default for FutureCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn set_then_take() {
        let cell = FutureCell::new();
        assert!(!cell.is_ready());
        cell.set_value(7);
        assert!(cell.is_ready());
        assert_eq!(cell.take(), 7);
    }

    #[test]
    fn ready_cell_is_ready() {
        let cell = FutureCell::ready("hi");
        assert!(cell.is_ready());
        assert_eq!(cell.take(), "hi");
    }

    #[test]
    #[should_panic(expected = "set twice")]
    fn double_set_is_a_programming_error() {
        let cell = FutureCell::new();
        cell.set_value(1);
        cell.set_value(2);
    }

    #[test]
    fn install_fails_on_ready_cell() {
        let cell = FutureCell::ready(1);
        let task = CondvarTask::new();
        assert!(!cell.try_install(task.as_task()));
    }

    #[test]
    fn installed_task_fires_exactly_once_on_set() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);

        #[repr(C)]
        struct CountingTask {
            raw: RawTask,
        }
        unsafe fn bump(_: *const RawTask) {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        let cell = FutureCell::new();
        let task = CountingTask {
            raw: RawTask::new(bump),
        };
        assert!(cell.try_install(&task.raw));
        cell.set_value(3);
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(cell.take(), 3);
    }

    #[test]
    fn wait_blocks_until_set_from_other_thread() {
        let cell = Arc::new(FutureCell::new());
        let setter = cell.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            setter.set_value(42);
        });
        assert_eq!(cell.get_blocking(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_timeout() {
        let cell: FutureCell<i32> = FutureCell::new();
        assert!(!cell.wait_timeout(Duration::from_millis(5)));
        // The waiter was reclaimed; a later set still works.
        cell.set_value(1);
        assert_eq!(cell.take(), 1);
    }

    #[test]
    fn wait_timeout_sees_value() {
        let cell = Arc::new(FutureCell::new());
        let setter = cell.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            setter.set_value(9);
        });
        assert!(cell.wait_timeout(Duration::from_secs(5)));
        assert_eq!(cell.take(), 9);
        handle.join().unwrap();
    }

    #[test]
    fn panic_payload_crosses_the_cell() {
        let cell: FutureCell<i32> = FutureCell::new();
        cell.set_panic(Box::new("boom"));
        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cell.take()))
            .expect_err("take should re-raise");
        assert_eq!(*err.downcast_ref::<&str>().unwrap(), "boom");
    }
}
