//! Stackful coroutine runtime over a post/timer reactor.
//!
//! Code is written in straight-line, synchronous style; every call to
//! [`await_on`] is a potential suspension point where the routine parks
//! its stack, frees the worker thread, and resumes later — possibly on a
//! different worker — when the awaited event fires.
//!
//! ```no_run
//! use std::time::Duration;
//! use weave::{await_on, sleep_for, Routine, WorkerPool};
//!
//! let pool = WorkerPool::new(2);
//! let routine = Routine::new(|| {
//!     await_on(sleep_for(Duration::from_millis(1)));
//!     6 * 7
//! });
//! assert_eq!(routine.join(), 42);
//! drop(pool);
//! ```
//!
//! The building blocks, bottom up: a lock-free future [`cell`], the
//! [`Promise`]/[`Future`] pair, the [`Reactor`] executor abstraction, the
//! [`Routine`] coroutine with its continuation handoff, the generic
//! [`await_on`] adapter, and synchronization built on the cell:
//! [`Mutex`], [`TimedMutex`], and the [`channel`] module's rendezvous and
//! bounded channels.

pub mod awaiter;
pub mod cell;
pub mod channel;
pub mod for_each;
pub mod future;
pub mod local;
pub mod mutex;
pub mod reactor;
pub mod routine;
pub mod task;
pub mod timed_mutex;

pub use awaiter::{
    await_all, await_on, run_outside_of_routine, sleep_for, sleep_for_on, Awaitable,
    IntoAwaitable, WaitHandle,
};
pub use cell::{FutureCell, PanicPayload};
pub use channel::{
    buffered_channel, generate, unbuffered_channel, BufferedReceiver, BufferedSender, Receiver,
    Sender,
};
pub use for_each::{for_each, for_each_iter, for_each_iter_on, for_each_on};
pub use future::{panicked_future, ready_future, spawn, spawn_on, Future, Promise};
pub use local::RoutineLocal;
pub use mutex::{Mutex, MutexGuard};
pub use reactor::{
    default_reactor, set_default_reactor, Reactor, TimerHandle, WorkGuard, WorkerPool,
};
pub use routine::{Routine, RoutineId, DEFAULT_STACK_SIZE};
pub use timed_mutex::{TimedMutex, TimedMutexGuard};

/// True when `WEAVE_DEBUG=1`: gates the crate's stderr diagnostics.
pub fn debug_enabled() -> bool {
    use std::sync::OnceLock;
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var("WEAVE_DEBUG").map_or(false, |v| v == "1"))
}

#[macro_export]
macro_rules! wv_debug {
    ($($arg:tt)*) => {
        if $crate::debug_enabled() {
            eprintln!("[weave] {}", format!($($arg)*));
        }
    };
}
