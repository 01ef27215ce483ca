//! Promise/future handle pair over a shared cell.
//!
//! The promise publishes exactly once; the future consumes exactly once.
//! A future is awaitable from routines and plain threads alike, and a
//! panic set on the promise re-raises at the consuming end.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::awaiter::{Awaitable, IntoAwaitable, WaitHandle};
use crate::cell::{FutureCell, PanicPayload};
use crate::reactor::{default_reactor, Reactor};
use crate::routine::Routine;

pub struct Promise<T: Send> {
    cell: Arc<FutureCell<T>>,
}

pub struct Future<T: Send> {
    cell: Arc<FutureCell<T>>,
}

impl<T: Send> Promise<T> {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(FutureCell::new()),
        }
    }

    /// A future observing this promise. May be called more than once; all
    /// handles share the one cell (and its single consumption).
    pub fn future(&self) -> Future<T> {
        Future {
            cell: self.cell.clone(),
        }
    }

    pub fn set_value(self, value: T) {
        self.cell.set_value(value);
    }

    /// Publish a captured panic; the consuming `get`/`await` re-raises it.
    pub fn set_panic(self, payload: PanicPayload) {
        self.cell.set_panic(payload);
    }
}

impl<T: Send> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Future<T> {
    pub fn is_ready(&self) -> bool {
        self.cell.is_ready()
    }

    /// Block the calling thread until the value is published.
    ///
    /// Note: a promise dropped without publishing leaves its futures
    /// waiting forever.
    pub fn wait(&self) {
        self.cell.wait();
    }

    /// Returns true if the value arrived within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.cell.wait_timeout(timeout)
    }

    /// Block until published, then consume the value.
    pub fn get(self) -> T {
        self.cell.get_blocking()
    }
}

pub struct FutureAwaiter<T: Send> {
    cell: Arc<FutureCell<T>>,
}

impl<T: Send> IntoAwaitable for Future<T> {
    type Awaiter = FutureAwaiter<T>;
    fn into_awaitable(self) -> FutureAwaiter<T> {
        FutureAwaiter { cell: self.cell }
    }
}

impl<T: Send> Awaitable for FutureAwaiter<T> {
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

/// A future that is already resolved; awaiting it never suspends.
pub fn ready_future<T: Send>(value: T) -> Future<T> {
    Future {
        cell: Arc::new(FutureCell::ready(value)),
    }
}

/// A future that re-raises `payload` when consumed.
pub fn panicked_future<T: Send>(payload: PanicPayload) -> Future<T> {
    let cell = Arc::new(FutureCell::new());
    cell.set_panic(payload);
    Future { cell }
}

/// Run `f` as a detached routine on the default reactor and expose its
/// outcome as a future.
pub fn spawn<F, T>(f: F) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_on(default_reactor(), f)
}

/// [`spawn`] on an explicit reactor.
pub fn spawn_on<F, T>(reactor: Arc<Reactor>, f: F) -> Future<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let promise = Promise::new();
    let future = promise.future();
    let routine_reactor = reactor.clone();
    reactor.post(move || {
        Routine::with_reactor(routine_reactor, move || {
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => promise.set_value(value),
                Err(payload) => promise.set_panic(payload),
            }
        })
        .detach();
    });
    future
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promise_set_future_get() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set_value(42);
        assert!(future.is_ready());
        assert_eq!(future.get(), 42);
    }

    #[test]
    fn ready_future_needs_no_wait() {
        let future = ready_future("done");
        assert!(future.is_ready());
        assert_eq!(future.get(), "done");
    }

    #[test]
    fn panicked_future_reraises() {
        let future = panicked_future::<i32>(Box::new(42i32));
        assert!(future.is_ready());
        let err = catch_unwind(AssertUnwindSafe(|| future.get())).expect_err("should re-raise");
        assert_eq!(*err.downcast_ref::<i32>().unwrap(), 42);
    }

    #[test]
    fn set_from_another_thread() {
        let promise = Promise::new();
        let future = promise.future();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            promise.set_value(7);
        });
        assert_eq!(future.get(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn wait_timeout_on_unset_promise() {
        let promise: Promise<i32> = Promise::new();
        let future = promise.future();
        assert!(!future.wait_timeout(Duration::from_millis(5)));
    }
}
