//! Parallel iteration over a collection, distributed across routines.
//!
//! Two entry points mirror the two distribution strategies: [`for_each`]
//! splits an owned `Vec` evenly across at most `parallelism` routines;
//! [`for_each_iter`] drives an arbitrary iterator through a bounded
//! channel consumed by `parallelism` worker routines.
//!
//! If workers panic, the first panic (first-writer-wins) is re-raised
//! after every routine has been joined; which items were processed by
//! then is unspecified.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex as StdMutex};

use crate::awaiter::await_on;
use crate::cell::PanicPayload;
use crate::channel::buffered_channel;
use crate::reactor::{default_reactor, Reactor};
use crate::routine::Routine;

type ErrorSlot = Arc<StdMutex<Option<PanicPayload>>>;

fn record_first(slot: &ErrorSlot, payload: PanicPayload) {
    let mut slot = slot.lock().unwrap();
    if slot.is_none() {
        *slot = Some(payload);
    }
}

fn join_and_rethrow(routines: Vec<Routine<()>>, errors: ErrorSlot) {
    for routine in &routines {
        await_on(routine);
    }
    drop(routines);
    if let Some(payload) = errors.lock().unwrap().take() {
        resume_unwind(payload);
    }
}

/// Apply `f` to every element, using up to `parallelism` routines on the
/// default reactor.
pub fn for_each<T, F>(parallelism: usize, items: Vec<T>, f: F)
where
    T: Send + 'static,
    F: FnMut(T) + Clone + Send + 'static,
{
    for_each_on(default_reactor(), parallelism, items, f)
}

pub fn for_each_on<T, F>(reactor: Arc<Reactor>, parallelism: usize, items: Vec<T>, f: F)
where
    T: Send + 'static,
    F: FnMut(T) + Clone + Send + 'static,
{
    assert!(parallelism > 0, "for_each needs at least one routine");
    if items.is_empty() {
        return;
    }
    let errors: ErrorSlot = Arc::new(StdMutex::new(None));
    let workers = parallelism.min(items.len());
    let per_worker = items.len() / workers;
    let extra = items.len() % workers;

    let mut routines = Vec::with_capacity(workers);
    let mut iter = items.into_iter();
    for index in 0..workers {
        let chunk: Vec<T> = iter
            .by_ref()
            .take(per_worker + usize::from(index < extra))
            .collect();
        let mut func = f.clone();
        let errors = errors.clone();
        routines.push(Routine::with_reactor(reactor.clone(), move || {
            let outcome = catch_unwind(AssertUnwindSafe(move || {
                for item in chunk {
                    func(item);
                }
            }));
            if let Err(payload) = outcome {
                record_first(&errors, payload);
            }
        }));
    }
    join_and_rethrow(routines, errors);
}

/// Apply `f` to every element of an arbitrary iterator: `parallelism`
/// consumer routines pull from a bounded channel fed by the caller.
pub fn for_each_iter<I, F>(parallelism: usize, items: I, f: F)
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: FnMut(I::Item) + Clone + Send + 'static,
{
    for_each_iter_on(default_reactor(), parallelism, items, f)
}

pub fn for_each_iter_on<I, F>(reactor: Arc<Reactor>, parallelism: usize, items: I, f: F)
where
    I: IntoIterator,
    I::Item: Send + 'static,
    F: FnMut(I::Item) + Clone + Send + 'static,
{
    assert!(parallelism > 0, "for_each_iter needs at least one routine");
    let errors: ErrorSlot = Arc::new(StdMutex::new(None));
    let (sender, receiver) = buffered_channel::<I::Item>(parallelism);

    let mut routines = Vec::with_capacity(parallelism);
    for _ in 0..parallelism {
        let receiver = receiver.clone();
        let mut func = f.clone();
        let errors = errors.clone();
        routines.push(Routine::with_reactor(reactor.clone(), move || {
            let outcome = catch_unwind(AssertUnwindSafe(move || {
                for item in receiver {
                    func(item);
                }
            }));
            if let Err(payload) = outcome {
                record_first(&errors, payload);
            }
        }));
    }
    drop(receiver);

    for item in items {
        if !sender.send(item) {
            // Every consumer died; the error slot explains why.
            debug_assert!(errors.lock().unwrap().is_some());
            break;
        }
    }
    drop(sender);

    join_and_rethrow(routines, errors);
}
