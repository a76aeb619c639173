//! Thread-local fiber slots
//!
//! Each OS thread tracks three fibers: the one currently executing, the
//! thread's root fiber (created implicitly on first use, owns no stack),
//! and an optional scheduler host fiber. The host chosen on resume/yield
//! is the scheduler fiber for scheduler-bound fibers, the root fiber
//! otherwise.

use crate::fiber::Fiber;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's root fiber (the initial execution context)
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Host fiber for scheduler-bound fibers on this thread
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Get the fiber currently executing on this thread
#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_current_fiber(f: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = f);
}

/// Get this thread's root fiber
#[inline]
pub fn thread_fiber() -> Option<Arc<Fiber>> {
    THREAD_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub(crate) fn set_thread_fiber(f: Option<Arc<Fiber>>) {
    THREAD_FIBER.with(|cell| *cell.borrow_mut() = f);
}

/// Get this thread's scheduler host fiber
#[inline]
pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|cell| cell.borrow().clone())
}

/// Set this thread's scheduler host fiber
#[inline]
pub(crate) fn set_scheduler_fiber(f: Option<Arc<Fiber>>) {
    SCHEDULER_FIBER.with(|cell| *cell.borrow_mut() = f);
}
