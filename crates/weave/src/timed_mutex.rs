//! Fair mutex with a lock timeout.
//!
//! Same counter-plus-FIFO protocol as [`crate::mutex`], but every waiter
//! carries a `finalized` flag and, for `try_lock_for`, a reactor timer.
//! Exactly one of {timeout handler, unlock handoff} wins the flag; the
//! winner owns the waiter's outcome. The timeout handler dequeues its own
//! waiter under the queue lock, so unlock never grants to a waiter that
//! already reported a timeout.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::awaiter::await_on;
use crate::cell::FutureCell;
use crate::reactor::{default_reactor, TimerHandle};
use crate::routine::Routine;

const SPIN_LIMIT: usize = 8;

#[derive(Debug, PartialEq, Eq)]
enum LockOutcome {
    Granted,
    TimedOut,
}

struct TimedWaiter {
    finalized: AtomicBool,
    cell: FutureCell<LockOutcome>,
    timer: StdMutex<Option<TimerHandle>>,
}

impl TimedWaiter {
    fn new() -> Self {
        Self {
            finalized: AtomicBool::new(false),
            cell: FutureCell::new(),
            timer: StdMutex::new(None),
        }
    }

    /// First caller wins the right to decide this waiter's outcome.
    fn claim(&self) -> bool {
        self.finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

type WaiterQueue = Arc<StdMutex<VecDeque<Arc<TimedWaiter>>>>;

pub struct TimedMutex<T: ?Sized> {
    count: AtomicI32,
    waiters: WaiterQueue,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for TimedMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for TimedMutex<T> {}

impl<T> TimedMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            count: AtomicI32::new(0),
            waiters: Arc::new(StdMutex::new(VecDeque::new())),
            data: UnsafeCell::new(data),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized> TimedMutex<T> {
    /// Fast path shared by `lock` and `try_lock_for`: returns true if the
    /// lock was taken without parking. On false, the caller's `+1` is
    /// already in the count and a grant is owed.
    fn spin_lock(&self) -> bool {
        for _ in 0..SPIN_LIMIT {
            match self
                .count
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(observed) => {
                    debug_assert!(observed >= 0);
                    if observed > 1 {
                        break;
                    }
                }
            }
        }
        std::thread::yield_now();
        self.count.fetch_add(1, Ordering::Acquire) == 0
    }

    pub fn lock(&self) -> TimedMutexGuard<'_, T> {
        if self.spin_lock() {
            return TimedMutexGuard { mutex: self };
        }
        let waiter = Arc::new(TimedWaiter::new());
        self.waiters.lock().unwrap().push_back(waiter.clone());
        let outcome = await_on(&waiter.cell);
        debug_assert_eq!(outcome, LockOutcome::Granted);
        TimedMutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<TimedMutexGuard<'_, T>> {
        self.count
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TimedMutexGuard { mutex: self })
    }

    /// Acquire the lock, giving up after `timeout`. A zero timeout is
    /// `try_lock`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<TimedMutexGuard<'_, T>> {
        if timeout.is_zero() {
            return self.try_lock();
        }
        if self.spin_lock() {
            return Some(TimedMutexGuard { mutex: self });
        }

        let waiter = Arc::new(TimedWaiter::new());
        self.waiters.lock().unwrap().push_back(waiter.clone());

        let reactor = Routine::<()>::current_reactor().unwrap_or_else(default_reactor);
        let queue = Arc::clone(&self.waiters);
        let armed = waiter.clone();
        let timer = reactor.schedule(timeout, move || {
            if armed.claim() {
                queue
                    .lock()
                    .unwrap()
                    .retain(|candidate| !Arc::ptr_eq(candidate, &armed));
                armed.cell.set_value(LockOutcome::TimedOut);
            }
        });
        // If the grant already happened, the handle is cancelled below the
        // grant path instead; storing late is harmless.
        *waiter.timer.lock().unwrap() = Some(timer);

        match await_on(&waiter.cell) {
            LockOutcome::Granted => Some(TimedMutexGuard { mutex: self }),
            LockOutcome::TimedOut => {
                self.count.fetch_sub(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn unlock(&self) {
        let remaining = self.count.fetch_sub(1, Ordering::Release) - 1;
        debug_assert!(remaining >= 0, "timed mutex unlocked without a matching lock");
        if remaining == 0 {
            return;
        }
        loop {
            let next = self.waiters.lock().unwrap().pop_front();
            match next {
                Some(waiter) => {
                    if !waiter.claim() {
                        // Timed out between our count check and the pop;
                        // its +1 will disappear, keep looking.
                        continue;
                    }
                    if let Some(timer) = waiter.timer.lock().unwrap().take() {
                        timer.cancel();
                    }
                    waiter.cell.set_value(LockOutcome::Granted);
                    return;
                }
                None => {
                    // Either a waiter raised the count but has not
                    // enqueued yet, or a timed-out waiter has dequeued but
                    // not yet dropped its count.
                    if self.count.load(Ordering::Acquire) == 0 {
                        return;
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl<T: ?Sized> Drop for TimedMutex<T> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.count.load(Ordering::Acquire),
            0,
            "timed mutex dropped while locked"
        );
    }
}

pub struct TimedMutexGuard<'a, T: ?Sized> {
    mutex: &'a TimedMutex<T>,
}

impl<T: ?Sized> Deref for TimedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TimedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for TimedMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
