//! Fair, routine-aware mutex built on the future cell.
//!
//! The state is one signed counter: 0 means unlocked, n >= 1 means locked
//! with n-1 waiters. A contended `lock` parks on a future cell pushed to a
//! FIFO queue; `unlock` hands the lock to exactly the oldest waiter, so
//! acquisitions happen in enqueue order.
//!
//! Works from routines (the waiter suspends, freeing the worker) and from
//! plain threads (the waiter blocks on a condition variable) alike.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex as StdMutex;

use crate::awaiter::await_on;
use crate::cell::FutureCell;

const SPIN_LIMIT: usize = 8;

struct WaiterPtr(*const FutureCell<()>);
// The pointee lives on a stack frame that stays parked until the waiter
// is granted the lock.
unsafe impl Send for WaiterPtr {}

pub struct Mutex<T: ?Sized> {
    count: AtomicI32,
    waiters: StdMutex<VecDeque<WaiterPtr>>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            count: AtomicI32::new(0),
            waiters: StdMutex::new(VecDeque::new()),
            data: UnsafeCell::new(data),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        for _ in 0..SPIN_LIMIT {
            match self
                .count
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return MutexGuard { mutex: self },
                Err(observed) => {
                    debug_assert!(observed >= 0);
                    if observed > 1 {
                        break;
                    }
                }
            }
        }
        std::thread::yield_now();

        if self.count.fetch_add(1, Ordering::Acquire) == 0 {
            return MutexGuard { mutex: self };
        }
        let cell = FutureCell::new();
        self.waiters
            .lock()
            .unwrap()
            .push_back(WaiterPtr(&cell as *const FutureCell<()>));
        await_on(&cell);
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.count
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self })
    }

    fn unlock(&self) {
        let remaining = self.count.fetch_sub(1, Ordering::Release) - 1;
        debug_assert!(remaining >= 0, "mutex unlocked without a matching lock");
        if remaining == 0 {
            return;
        }
        // A waiter raised the count before enqueueing itself; retry until
        // its cell shows up.
        let next = loop {
            if let Some(next) = self.waiters.lock().unwrap().pop_front() {
                break next;
            }
            std::thread::yield_now();
        };
        // Outside the queue lock: granting may resume a routine inline.
        unsafe { (*next.0).set_value(()) };
    }
}

impl<T: ?Sized> Drop for Mutex<T> {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.count.load(Ordering::Acquire),
            0,
            "mutex dropped while locked"
        );
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
