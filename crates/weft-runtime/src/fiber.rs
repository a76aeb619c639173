//! Stackful fibers
//!
//! A fiber is a cooperatively scheduled execution context with three
//! states (READY, RUNNING, TERM). The design is non-symmetric: a fiber
//! always yields back to its host (the thread's root fiber, or the
//! scheduler fiber for scheduler-bound fibers), never directly to a peer.
//! This keeps the switch graph bounded and puts all suspension logic in
//! one place, the scheduler.

use crate::arch::{self, FiberContext};
use crate::stack::FiberStack;
use crate::tls;

use weft_core::constants::DEFAULT_STACK_SIZE;
use weft_core::id::{self, FiberId};
use weft_core::state::FiberState;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Entry callback for a fiber
pub type FiberEntry = Box<dyn FnOnce() + Send>;

/// A stackful user-space task
///
/// Created with an entry callback and an owned stack; resumed from READY,
/// yields back from RUNNING. When the entry callback returns the fiber
/// transitions to TERM exactly once, and may only be revived via
/// [`Fiber::reset`].
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    ctx: UnsafeCell<FiberContext>,
    stack: Option<FiberStack>,
    entry: Mutex<Option<FiberEntry>>,
    scheduler_bound: bool,
    /// Held by the resumer for the whole resume. A continuation submitted
    /// while the fiber is still mid-yield blocks here until the register
    /// save completed, so RUNNING holds on at most one worker.
    run_lock: Mutex<()>,
    self_weak: Weak<Fiber>,
}

// ctx is only touched by the thread driving the READY<->RUNNING
// transition; entry sits behind a mutex; the stack is owned.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `entry` on its own stack
    ///
    /// `stack_size` of 0 selects the default (128 KiB). Scheduler-bound
    /// fibers resume/yield against the thread's scheduler fiber; others
    /// use the thread's root fiber.
    ///
    /// Stack exhaustion is a resource error with no local recovery, so
    /// allocation failure aborts.
    pub fn new<F>(entry: F, stack_size: usize, scheduler_bound: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = FiberStack::new(size).expect("fiber stack allocation failed");

        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            ctx: UnsafeCell::new(FiberContext::zeroed()),
            stack: Some(stack),
            entry: Mutex::new(Some(Box::new(entry))),
            scheduler_bound,
            run_lock: Mutex::new(()),
            self_weak: weak.clone(),
        });

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        id::fiber_created();
        fiber
    }

    /// The root fiber for a thread: no stack of its own, starts RUNNING,
    /// never reaches TERM.
    fn new_root() -> Arc<Fiber> {
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            ctx: UnsafeCell::new(FiberContext::zeroed()),
            stack: None,
            entry: Mutex::new(None),
            scheduler_bound: false,
            run_lock: Mutex::new(()),
            self_weak: weak.clone(),
        });
        id::fiber_created();
        fiber
    }

    /// Get the fiber currently executing on this thread, creating the
    /// thread's root fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let root = Self::new_root();
        tls::set_thread_fiber(Some(root.clone()));
        tls::set_current_fiber(Some(root.clone()));
        root
    }

    /// Get the current fiber without materializing a root fiber
    pub fn try_current() -> Option<Arc<Fiber>> {
        tls::current_fiber()
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    pub fn scheduler_bound(&self) -> bool {
        self.scheduler_bound
    }

    #[inline]
    pub(crate) fn run_lock(&self) -> &Mutex<()> {
        &self.run_lock
    }

    /// Host fiber this fiber switches against on the current thread
    fn host(&self) -> Arc<Fiber> {
        if self.scheduler_bound {
            if let Some(f) = tls::scheduler_fiber() {
                return f;
            }
        }
        tls::thread_fiber().expect("no root fiber on this thread")
    }

    /// Switch from the host into this fiber
    ///
    /// Precondition: state == READY. Returns when the fiber yields or
    /// terminates; at that point its registers are fully saved.
    pub fn resume(&self) {
        let _ = Fiber::current();
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume requires a READY fiber"
        );
        self.set_state(FiberState::Running);

        let this = self
            .self_weak
            .upgrade()
            .expect("fiber resumed without a live handle");
        let host = self.host();
        let host_ctx = host.ctx.get();
        tls::set_current_fiber(Some(this));
        unsafe { arch::context_switch(host_ctx, self.ctx.get()) };
    }

    /// Suspend the current fiber and switch back to its host
    ///
    /// A RUNNING fiber becomes READY; a TERM fiber stays TERM (this is how
    /// the entry epilogue returns control).
    pub fn yield_now() {
        let cur = tls::current_fiber().expect("yield_now outside a fiber context");
        debug_assert!(matches!(
            cur.state(),
            FiberState::Running | FiberState::Term
        ));
        if cur.state() == FiberState::Running {
            cur.set_state(FiberState::Ready);
        }

        let host = cur.host();
        let cur_ctx = cur.ctx.get();
        let host_ctx = host.ctx.get();
        tls::set_current_fiber(Some(host));
        drop(cur);
        unsafe { arch::context_switch(cur_ctx, host_ctx) };
        // resumed again: execution continues here on the fiber's stack
    }

    /// Re-initialize a TERM fiber with a fresh entry callback, reusing the
    /// stack. The fiber becomes READY.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(self.state(), FiberState::Term, "reset requires a TERM fiber");
        let stack = self.stack.as_ref().expect("reset requires an owned stack");

        *self.entry.lock().unwrap() = Some(Box::new(entry));
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_entry as usize,
                self.self_weak.as_ptr() as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        id::fiber_destroyed();
    }
}

/// Entry point executed on the fiber's own stack
///
/// Runs the callback and clears the slot so a later `reset` sees it
/// clean. The trampoline then calls `fiber_finished`.
pub(crate) extern "C" fn fiber_entry(fiber: usize) {
    let fiber = unsafe { &*(fiber as *const Fiber) };
    let cb = fiber.entry.lock().unwrap().take();
    if let Some(cb) = cb {
        cb();
    }
}

/// Epilogue after the entry callback returned
///
/// Marks TERM and switches to the host. Control never returns here; the
/// fiber handle stays alive because the resumer holds a reference for the
/// duration of the run, and no handle is touched after the switch.
pub(crate) extern "C" fn fiber_finished() {
    let (cur_ctx, host_ctx);
    {
        let cur = tls::current_fiber().expect("fiber epilogue outside a fiber context");
        cur.set_state(FiberState::Term);
        let host = cur.host();
        cur_ctx = cur.ctx.get();
        host_ctx = host.ctx.get();
        tls::set_current_fiber(Some(host));
    }
    unsafe { arch::context_switch(cur_ctx, host_ctx) };
    unreachable!("terminated fiber resumed");
}
