//! End-to-end routine behavior: suspension, thread migration, nesting,
//! detach cleanup, panic propagation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weave::{
    await_on, run_outside_of_routine, sleep_for_on, Promise, Reactor, Routine, WorkerPool,
};

fn pool_of(workers: usize) -> (Arc<Reactor>, WorkerPool) {
    let reactor = Arc::new(Reactor::new());
    let pool = WorkerPool::with_reactor(workers, reactor.clone());
    (reactor, pool)
}

#[test]
fn sleep_migrates_to_the_worker_thread() {
    let (reactor, _pool) = pool_of(1);

    let timer_reactor = reactor.clone();
    let routine = Routine::with_reactor(reactor, move || {
        let start = thread::current().id();
        await_on(sleep_for_on(timer_reactor.clone(), Duration::from_millis(1)));
        let middle = thread::current().id();
        await_on(sleep_for_on(timer_reactor.clone(), Duration::from_millis(1)));
        let end = thread::current().id();
        (start, middle, end)
    });

    let (start, middle, end) = routine.join();
    assert_ne!(start, middle, "first sleep should move off the test thread");
    assert_eq!(middle, end, "a single worker serves both timers");
}

#[test]
fn promise_set_on_another_thread_resumes_the_routine() {
    let routine = Routine::new(|| {
        let promise = Promise::new();
        let future = promise.future();
        // The routine resumes inline on this setter thread, so the handle
        // must not be joined from inside the routine.
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            promise.set_value(42);
        });
        await_on(future)
    });
    assert_eq!(routine.join(), 42);
}

#[test]
fn routine_in_routine_returns_inner_value() {
    let (reactor, _pool) = pool_of(2);

    let inner_reactor = reactor.clone();
    let outer = Routine::with_reactor(reactor, move || {
        let yield_reactor = inner_reactor.clone();
        let inner = Routine::with_reactor(inner_reactor.clone(), move || {
            await_on(&yield_reactor);
            7
        });
        await_on(&inner)
    });
    assert_eq!(outer.join(), 7);
}

#[test]
fn inner_routine_already_done_resumes_inline() {
    let outer = Routine::new(|| {
        // The inner body never suspends, so it completes during
        // construction and the await consumes it without parking.
        let inner = Routine::new(|| 13);
        assert!(inner.is_ready());
        await_on(&inner)
    });
    assert_eq!(outer.join(), 13);
}

#[test]
fn current_tracks_the_innermost_routine() {
    assert!(Routine::<()>::current().is_none());

    let checked = Routine::new(|| {
        let me = Routine::<()>::current().expect("inside a routine");
        let inner = Routine::new(|| Routine::<()>::current().expect("inside the inner routine"));
        let inner_id = await_on(&inner);
        assert_ne!(me, inner_id);
        // Construction of the inner routine restored our identity.
        assert_eq!(Routine::<()>::current(), Some(me));
        true
    });
    assert!(checked.join());
    assert!(Routine::<()>::current().is_none());
}

#[test]
fn panic_in_body_reraises_at_join() {
    let routine = Routine::<()>::new(|| panic!("boom from the routine"));
    assert!(routine.is_ready());
    let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| routine.join()))
        .expect_err("join should re-raise the body panic");
    assert_eq!(*err.downcast_ref::<&str>().unwrap(), "boom from the routine");
}

#[test]
fn detached_routines_clean_themselves_up() {
    let (reactor, _pool) = pool_of(4);

    const COUNT: usize = 2000;
    for _ in 0..COUNT {
        let timer_reactor = reactor.clone();
        Routine::with_stack_size(reactor.clone(), 32 * 1024, move || {
            await_on(sleep_for_on(timer_reactor, Duration::from_millis(1)));
        })
        .detach();
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while reactor.live_routines() != 0 {
        assert!(
            Instant::now() < deadline,
            "detached routines leaked: {} still live",
            reactor.live_routines()
        );
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn fan_out_join_collects_all_results() {
    let (reactor, _pool) = pool_of(4);

    let routines: Vec<Routine<usize>> = (0..100)
        .map(|i| {
            let timer_reactor = reactor.clone();
            Routine::with_reactor(reactor.clone(), move || {
                await_on(sleep_for_on(timer_reactor, Duration::from_millis(1)));
                i * i
            })
        })
        .collect();

    let total: usize = routines.into_iter().map(Routine::join).sum();
    assert_eq!(total, 328350);
}

#[test]
fn run_outside_of_routine_on_a_plain_thread_is_direct() {
    let here = thread::current().id();
    let there = run_outside_of_routine(move || thread::current().id());
    assert_eq!(here, there);
}

#[test]
fn run_outside_of_routine_leaves_the_routine_context() {
    let (reactor, _pool) = pool_of(2);

    let routine = Routine::with_reactor(reactor, || {
        assert!(Routine::<()>::current().is_some());
        run_outside_of_routine(|| Routine::<()>::current().is_none())
    });
    assert!(routine.join());
}

#[test]
fn reactor_accessors_return_the_bound_reactor() {
    let (reactor, _pool) = pool_of(1);

    let expected = Arc::as_ptr(&reactor);
    let routine = Routine::with_reactor(reactor.clone(), || {
        Arc::as_ptr(&Routine::<()>::current_reactor().expect("bound reactor")) as usize
    });
    assert_eq!(Arc::as_ptr(&routine.reactor()), expected);
    assert_eq!(routine.join(), expected as usize);
}

#[test]
fn many_suspensions_on_one_routine() {
    let (reactor, _pool) = pool_of(2);

    let hops = Arc::new(AtomicUsize::new(0));
    let counted = hops.clone();
    let hop_reactor = reactor.clone();
    let routine = Routine::with_reactor(reactor, move || {
        for _ in 0..1000 {
            await_on(&hop_reactor);
            counted.fetch_add(1, Ordering::Relaxed);
        }
    });
    routine.join();
    assert_eq!(hops.load(Ordering::Relaxed), 1000);
}
