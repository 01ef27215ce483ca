//! Promise/future behavior through the await machinery.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use weave::{
    await_all, await_on, panicked_future, ready_future, spawn_on, Promise, Reactor, Routine,
    WorkerPool,
};

#[test]
fn awaiting_a_ready_future_never_suspends() {
    // No routine, no workers: the ready path must complete synchronously.
    assert_eq!(await_on(ready_future(5)), 5);

    let routine = Routine::new(|| {
        let before = thread::current().id();
        let value = await_on(ready_future("inline"));
        assert_eq!(thread::current().id(), before);
        value
    });
    assert_eq!(routine.join(), "inline");
}

#[test]
fn panicked_future_reraises_through_await() {
    let future = panicked_future::<u32>(Box::new("poisoned"));
    let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| await_on(future)))
        .expect_err("await should re-raise");
    assert_eq!(*err.downcast_ref::<&str>().unwrap(), "poisoned");
}

#[test]
fn await_future_from_plain_thread_blocks() {
    let promise = Promise::new();
    let future = promise.future();
    let setter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        promise.set_value(17);
    });
    assert_eq!(await_on(future), 17);
    setter.join().unwrap();
}

#[test]
fn spawn_runs_on_the_reactor() {
    let reactor = Arc::new(Reactor::new());
    let _pool = WorkerPool::with_reactor(2, reactor.clone());

    let future = spawn_on(reactor, || 21 * 2);
    assert_eq!(future.get(), 42);
}

#[test]
fn spawn_propagates_panics() {
    let reactor = Arc::new(Reactor::new());
    let _pool = WorkerPool::with_reactor(1, reactor.clone());

    let future = spawn_on(reactor, || -> u32 { panic!("spawned failure") });
    let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| future.get()))
        .expect_err("get should re-raise");
    assert_eq!(*err.downcast_ref::<&str>().unwrap(), "spawned failure");
}

#[test]
fn await_all_collects_in_order() {
    let reactor = Arc::new(Reactor::new());
    let _pool = WorkerPool::with_reactor(2, reactor.clone());

    let routine = Routine::with_reactor(reactor.clone(), move || {
        let futures: Vec<_> = (0..10u64)
            .map(|i| {
                let promise = Promise::new();
                let future = promise.future();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(1 + (10 - i) % 3));
                    promise.set_value(i);
                });
                future
            })
            .collect();
        await_all(futures)
    });
    assert_eq!(routine.join(), (0..10).collect::<Vec<_>>());
}

#[test]
fn await_all_of_ready_futures_is_inline() {
    let routine = Routine::new(|| await_all(vec![ready_future(1), ready_future(2)]));
    assert_eq!(routine.join(), vec![1, 2]);
}

#[test]
fn await_all_from_plain_thread() {
    let results = await_all(vec![ready_future(3), ready_future(4)]);
    assert_eq!(results, vec![3, 4]);
}
