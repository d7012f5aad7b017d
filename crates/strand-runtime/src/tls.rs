//! Thread-local anchors
//!
//! Per OS thread the runtime tracks: the fiber currently executing, the
//! thread's main fiber (adopting the native stack), the scheduler fiber
//! (distinct from the main fiber only on a caller-participating thread),
//! the scheduler this thread works for, and the thread name.
//!
//! All slots are lazily initialized and need no locking.

use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };
    static THREAD_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

#[inline]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current_fiber(f: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = f);
}

#[inline]
pub(crate) fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_main_fiber(f: Option<Arc<Fiber>>) {
    MAIN_FIBER.with(|c| *c.borrow_mut() = f);
}

#[inline]
pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_scheduler_fiber(f: Option<Arc<Fiber>>) {
    SCHEDULER_FIBER.with(|c| *c.borrow_mut() = f);
}

#[inline]
pub(crate) fn current_scheduler() -> Weak<Scheduler> {
    CURRENT_SCHEDULER.with(|c| c.borrow().clone())
}

#[inline]
pub(crate) fn set_current_scheduler(s: Weak<Scheduler>) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = s);
}

/// Name of the current thread; "UNKNOWN" until set.
pub fn thread_name() -> String {
    THREAD_NAME.with(|c| c.borrow().clone().unwrap_or_else(|| String::from("UNKNOWN")))
}

/// Set the current thread's name.
pub fn set_thread_name(name: &str) {
    THREAD_NAME.with(|c| *c.borrow_mut() = Some(name.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_name_default() {
        let t = std::thread::spawn(|| thread_name());
        assert_eq!(t.join().unwrap(), "UNKNOWN");
    }

    #[test]
    fn test_thread_name_set() {
        std::thread::spawn(|| {
            set_thread_name("worker_0");
            assert_eq!(thread_name(), "worker_0");
        })
        .join()
        .unwrap();
    }
}
