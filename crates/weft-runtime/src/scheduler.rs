//! FIFO scheduler with worker affinity
//!
//! Owns a worker pool and a queue of (fiber-or-callback, optional worker
//! affinity) tasks, dispatched onto workers via cooperative resume. Each
//! worker runs the loop directly on its thread; when the queue yields
//! nothing it resumes a per-worker idle fiber.
//!
//! The I/O layer plugs in through the [`Reactor`] capability trait: it
//! overrides tickle (self-pipe), stopping (timers + pending events) and
//! the idle body (readiness wait). Without a reactor, tickle notifies a
//! condvar the idle fiber parks on.

use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::tls;

use weft_core::kprint;
use weft_core::state::FiberState;
use weft_core::{kdebug, kerror};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use weft_core::constants::MAX_IDLE_WAIT_MS;

/// A schedulable unit: an existing fiber, or a bare callback that gets a
/// one-shot fiber when dispatched.
pub enum TaskPayload {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

impl From<Arc<Fiber>> for TaskPayload {
    fn from(f: Arc<Fiber>) -> Self {
        TaskPayload::Fiber(f)
    }
}

struct ScheduleTask {
    payload: TaskPayload,
    /// Pin to a specific worker id; None = any worker
    affinity: Option<usize>,
}

/// Capability interface the I/O manager implements to override the
/// scheduler's wakeup, shutdown predicate and idle behavior.
pub trait Reactor: Send + Sync {
    /// Wake one idle worker
    fn tickle(&self);

    /// True when no work of any kind remains and stop was requested
    fn stopping(&self) -> bool;

    /// Body of the per-worker idle fiber
    fn idle(&self);

    /// Per-worker-thread setup (TLS installation)
    fn on_thread_start(&self) {}
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Weak<Scheduler>> = const { RefCell::new(Weak::new()) };
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Scheduler for this thread, if it is a worker (or the caller thread of
/// a use_caller scheduler).
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().upgrade())
}

/// Worker id of the current thread, if it is a worker
pub fn current_worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

/// Fixed-pool fiber scheduler
pub struct Scheduler {
    name: String,
    workers: usize,
    use_caller: bool,
    stack_size: usize,
    debug: bool,

    tasks: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<JoinHandle<()>>>,

    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    stopping: AtomicBool,
    stopped: AtomicBool,

    /// Scheduler fiber for the caller thread; its loop only runs from stop()
    caller_fiber: Mutex<Option<Arc<Fiber>>>,

    reactor: OnceLock<Weak<dyn Reactor>>,
    /// Default tickle/idle rendezvous when no reactor is installed
    idle_park: (Mutex<bool>, Condvar),

    self_weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with explicit worker count and name
    pub fn new(workers: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_config(
            SchedulerConfig::from_env()
                .workers(workers)
                .use_caller(use_caller)
                .name(name),
        )
    }

    /// Create a scheduler from a full configuration
    ///
    /// With `use_caller`, the calling thread becomes the last worker
    /// (id = workers - 1): its root fiber is materialized now, a dedicated
    /// scheduler fiber is prepared, and its loop runs when `stop()` drains.
    pub fn with_config(config: SchedulerConfig) -> Arc<Scheduler> {
        config.validate().expect("invalid scheduler configuration");

        let sched = Arc::new_cyclic(|weak| Scheduler {
            name: config.name.clone(),
            workers: config.workers,
            use_caller: config.use_caller,
            stack_size: config.stack_size,
            debug: config.debug_logging,
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            caller_fiber: Mutex::new(None),
            reactor: OnceLock::new(),
            idle_park: (Mutex::new(false), Condvar::new()),
            self_weak: weak.clone(),
        });

        if sched.use_caller {
            Fiber::current();
            let weak = sched.self_weak.clone();
            let caller_id = sched.workers - 1;
            let f = Fiber::new(
                move || {
                    if let Some(s) = weak.upgrade() {
                        s.run(caller_id);
                    }
                },
                sched.stack_size,
                false,
            );
            tls::set_scheduler_fiber(Some(f.clone()));
            *sched.caller_fiber.lock().unwrap() = Some(f);
            CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = sched.self_weak.clone());
            WORKER_ID.with(|cell| cell.set(caller_id));
        }

        sched
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[inline]
    pub fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Install the reactor override. May be called at most once, before
    /// `start()`.
    pub fn set_reactor(&self, reactor: Weak<dyn Reactor>) {
        let _ = self.reactor.set(reactor);
    }

    fn reactor(&self) -> Option<Arc<dyn Reactor>> {
        self.reactor.get().and_then(|w| w.upgrade())
    }

    /// Spawn the worker threads
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();
        if self.stopping.load(Ordering::Acquire) {
            kerror!("scheduler {}: start() after stop ignored", self.name);
            return;
        }
        assert!(threads.is_empty());

        let spawn_count = if self.use_caller {
            self.workers - 1
        } else {
            self.workers
        };
        for id in 0..spawn_count {
            let sched = self.self_weak.upgrade().expect("scheduler not in an Arc");
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, id))
                .spawn(move || sched.run(id))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
    }

    /// Append a task; wakes a worker if the queue was empty.
    ///
    /// Submission to a stopped scheduler is dropped (logged at error
    /// level). Submissions while stopping are still accepted so
    /// cancellation continuations can drain.
    pub fn submit(&self, payload: TaskPayload, affinity: Option<usize>) {
        if self.stopped.load(Ordering::Acquire) {
            kerror!("scheduler {}: submit to stopped scheduler dropped", self.name);
            return;
        }
        let was_empty = {
            let mut q = self.tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(ScheduleTask { payload, affinity });
            was_empty
        };
        if was_empty {
            self.tickle();
        }
    }

    /// Submit a bare callback
    pub fn submit_call<F>(&self, f: F, affinity: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(TaskPayload::Call(Box::new(f)), affinity);
    }

    /// Wake one idle worker
    pub fn tickle(&self) {
        if let Some(r) = self.reactor() {
            r.tickle();
            return;
        }
        let (lock, cvar) = &self.idle_park;
        let mut tickled = lock.lock().unwrap();
        *tickled = true;
        cvar.notify_one();
    }

    /// Base shutdown predicate: stop requested, queue drained, no worker
    /// mid-task. The reactor extends this with timers and pending events.
    pub fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }

    /// Effective shutdown predicate (reactor override when installed)
    pub fn stopping(&self) -> bool {
        match self.reactor() {
            Some(r) => r.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Idle body when no reactor is installed: park on the tickle condvar
    /// (bounded so shutdown is never missed), then yield back to the
    /// worker loop.
    fn default_idle(&self) {
        while !self.stopping() {
            let (lock, cvar) = &self.idle_park;
            {
                let mut tickled = lock.lock().unwrap();
                if !*tickled {
                    let (guard, _) = cvar
                        .wait_timeout(tickled, Duration::from_millis(MAX_IDLE_WAIT_MS))
                        .unwrap();
                    tickled = guard;
                }
                *tickled = false;
            }
            Fiber::yield_now();
        }
    }

    /// Worker loop. Runs directly on each spawned worker thread, and on
    /// the caller thread (inside its scheduler fiber) during stop().
    fn run(self: Arc<Self>, worker_id: usize) {
        WORKER_ID.with(|cell| cell.set(worker_id));
        CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = self.self_weak.clone());
        kprint::set_thread_tag(format!("{}-{}", self.name, worker_id));
        if self.debug {
            kdebug!("worker starting");
        }

        let reactor = self.reactor();
        if let Some(r) = &reactor {
            r.on_thread_start();
        }
        Fiber::current();

        let idle_fiber = {
            let sched = self.clone();
            let reactor = reactor.clone();
            Fiber::new(
                move || match &reactor {
                    Some(r) => r.idle(),
                    None => sched.default_idle(),
                },
                self.stack_size,
                true,
            )
        };

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut q = self.tasks.lock().unwrap();
                let mut idx = 0;
                while idx < q.len() {
                    if let Some(aff) = q[idx].affinity {
                        if aff != worker_id {
                            // pinned elsewhere; its owner needs a wakeup
                            tickle_me = true;
                            idx += 1;
                            continue;
                        }
                    }
                    task = q.remove(idx);
                    self.active_workers.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !q.is_empty();
            }
            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.payload) {
                Some(TaskPayload::Fiber(f)) => {
                    {
                        let _guard = f.run_lock().lock().unwrap();
                        if f.state() != FiberState::Term {
                            f.resume();
                        }
                    }
                    self.active_workers.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskPayload::Call(cb)) => {
                    let f = Fiber::new(cb, self.stack_size, true);
                    {
                        let _guard = f.run_lock().lock().unwrap();
                        f.resume();
                    }
                    self.active_workers.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    // Exits only after stopping() held inside the idle body
                    if idle_fiber.state() == FiberState::Term {
                        if self.debug {
                            kdebug!("worker exiting");
                        }
                        break;
                    }
                    self.idle_workers.fetch_add(1, Ordering::SeqCst);
                    {
                        let _guard = idle_fiber.run_lock().lock().unwrap();
                        idle_fiber.resume();
                    }
                    self.idle_workers.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Request shutdown, drain on the caller thread if it participates,
    /// and join all workers.
    pub fn stop(&self) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.stopping.store(true, Ordering::Release);

        for _ in 0..self.workers {
            self.tickle();
        }
        if self.use_caller {
            self.tickle();
        }

        // Only the caller thread can run its scheduler fiber
        let caller = self.caller_fiber.lock().unwrap().take();
        if let Some(f) = caller {
            if f.state() != FiberState::Term {
                f.resume();
            }
            tls::set_scheduler_fiber(None);
        }

        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        self.stopped.store(true, Ordering::Release);
        if self.debug {
            kdebug!("scheduler {}: stopped", self.name);
        }
    }
}
