//! Per-routine typed storage with a thread-local fallback.
//!
//! A `RoutineLocal<T>` is keyed by its own address, so the intended use is
//! a `static`. Accessed inside a routine it resolves to a slot owned by
//! that routine (destroyed with it); on a plain thread it falls back to
//! ordinary thread-local storage.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;

use crate::routine::current_raw;

thread_local! {
    static FALLBACK: RefCell<HashMap<usize, Box<dyn Any + Send>>> =
        RefCell::new(HashMap::new());
}

pub struct RoutineLocal<T: Send + 'static> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> RoutineLocal<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Store a value for the current routine (or thread), replacing and
    /// dropping any previous one.
    pub fn set(&self, value: T) {
        let key = self.key();
        let boxed: Box<dyn Any + Send> = Box::new(value);
        let routine = current_raw();
        if routine.is_null() {
            FALLBACK.with(|map| {
                map.borrow_mut().insert(key, boxed);
            });
        } else {
            // Only the thread currently executing the routine touches its
            // local map; suspension points never run concurrently with us.
            let locals = unsafe { &mut *(*routine).locals.get() };
            locals.insert(key, boxed);
        }
    }

    /// Remove and return the current slot's value.
    pub fn take(&self) -> Option<T> {
        let key = self.key();
        let routine = current_raw();
        let boxed = if routine.is_null() {
            FALLBACK.with(|map| map.borrow_mut().remove(&key))
        } else {
            let locals = unsafe { &mut *(*routine).locals.get() };
            locals.remove(&key)
        };
        boxed.map(|b| *b.downcast::<T>().expect("routine-local type mismatch"))
    }

    pub fn is_set(&self) -> bool {
        let key = self.key();
        let routine = current_raw();
        if routine.is_null() {
            FALLBACK.with(|map| map.borrow().contains_key(&key))
        } else {
            let locals = unsafe { &*(*routine).locals.get() };
            locals.contains_key(&key)
        }
    }

    /// Run `f` with mutable access to the slot. Do not call `set`/`take`
    /// on the same local from inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let key = self.key();
        let routine = current_raw();
        if routine.is_null() {
            FALLBACK.with(|map| {
                let mut map = map.borrow_mut();
                f(map.get_mut(&key).and_then(|b| b.downcast_mut::<T>()))
            })
        } else {
            let locals = unsafe { &mut *(*routine).locals.get() };
            f(locals.get_mut(&key).and_then(|b| b.downcast_mut::<T>()))
        }
    }
}

impl<T: Send + 'static> Default for RoutineLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_fallback_roundtrip() {
        static SLOT: RoutineLocal<u32> = RoutineLocal::new();
        assert!(!SLOT.is_set());
        SLOT.set(5);
        assert!(SLOT.is_set());
        SLOT.with(|v| *v.unwrap() += 1);
        assert_eq!(SLOT.take(), Some(6));
        assert!(!SLOT.is_set());
    }

    #[test]
    fn distinct_locals_do_not_alias() {
        static A: RoutineLocal<u32> = RoutineLocal::new();
        static B: RoutineLocal<u32> = RoutineLocal::new();
        A.set(1);
        B.set(2);
        assert_eq!(A.take(), Some(1));
        assert_eq!(B.take(), Some(2));
    }

    #[test]
    fn threads_have_private_slots() {
        static SLOT: RoutineLocal<u32> = RoutineLocal::new();
        SLOT.set(10);
        std::thread::spawn(|| {
            assert!(!SLOT.is_set());
            SLOT.set(20);
            assert_eq!(SLOT.take(), Some(20));
        })
        .join()
        .unwrap();
        assert_eq!(SLOT.take(), Some(10));
    }
}
