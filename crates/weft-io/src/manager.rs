//! Edge-triggered I/O manager
//!
//! Composes a [`Scheduler`] and a [`TimerManager`] with an epoll readiness
//! set. Each fd gets a context with one continuation slot per direction
//! (READ/WRITE); arming a direction registers it edge-triggered with the
//! kernel and parks the current fiber (or a callback) in the slot. The
//! per-worker idle fiber runs the readiness wait, drains expired timers,
//! and fires ready continuations as scheduler tasks.
//!
//! A self-pipe registered with the readiness set interrupts the wait:
//! one byte per tickle, drained fully on arrival (edge-triggered).

use weft_core::constants::{EVENT_BATCH, FD_SLOTS_INITIAL, MAX_IDLE_WAIT_MS};
use weft_core::error::{SchedError, SchedResult};
use weft_core::state::FiberState;
use weft_core::{kdebug, kerror};
use weft_runtime::scheduler::{Reactor, TaskPayload};
use weft_runtime::{Fiber, Scheduler, SchedulerConfig, TimerManager};

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Readiness direction; values equal the kernel flag bits so mask
/// arithmetic is direct (READ = EPOLLIN, WRITE = EPOLLOUT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    Read = 0x1,
    Write = 0x4,
}

impl Event {
    #[inline]
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// Continuation armed for one direction of one fd
struct EventSlot {
    scheduler: Weak<Scheduler>,
    task: Option<TaskPayload>,
}

impl EventSlot {
    const fn empty() -> Self {
        Self {
            scheduler: Weak::new(),
            task: None,
        }
    }

    fn take(&mut self) -> Option<(Weak<Scheduler>, TaskPayload)> {
        let task = self.task.take()?;
        Some((std::mem::replace(&mut self.scheduler, Weak::new()), task))
    }
}

struct FdState {
    /// Directions currently registered with the kernel
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

impl FdState {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Per-fd readiness context; its address is the epoll userdata
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            inner: Mutex::new(FdState {
                events: 0,
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }),
        }
    }
}

thread_local! {
    static CURRENT_IO: RefCell<Weak<IoManager>> = const { RefCell::new(Weak::new()) };
}

/// Readiness engine over epoll
///
/// Internal setup failures (epoll/pipe creation, registrations for the
/// self-pipe) are programming or resource-exhaustion errors and abort.
///
/// `stop()` must be called (from the creating thread when `use_caller`)
/// before dropping the last handle; workers hold references until then.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    /// Contexts are created eagerly and never removed, so the raw pointer
    /// handed to the kernel stays valid for the manager's lifetime.
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    self_weak: Weak<IoManager>,
}

impl IoManager {
    /// Create the manager and start its worker pool
    pub fn new(workers: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        Self::with_config(
            SchedulerConfig::from_env()
                .workers(workers)
                .use_caller(use_caller)
                .name(name),
        )
    }

    /// Create from a full scheduler configuration
    pub fn with_config(config: SchedulerConfig) -> Arc<IoManager> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epfd >= 0, "epoll_create1 failed");

        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0, "self-pipe creation failed");
        let rt = unsafe { libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert!(rt >= 0, "self-pipe O_NONBLOCK failed");

        // Self-pipe read end: edge-triggered, userdata 0 marks it apart
        // from fd contexts (whose userdata is a non-null pointer).
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: 0,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) };
        assert_eq!(rt, 0, "self-pipe epoll registration failed");

        let iom = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let scheduler = Scheduler::with_config(config);
            let timers = TimerManager::new();

            let wake = weak.clone();
            timers.set_wake(Box::new(move || {
                if let Some(m) = wake.upgrade() {
                    m.tickle();
                }
            }));
            let reactor: Weak<dyn Reactor> = weak.clone();
            scheduler.set_reactor(reactor);

            IoManager {
                scheduler,
                timers,
                epfd,
                tickle_fds: fds,
                pending_events: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
                self_weak: weak.clone(),
            }
        });

        iom.grow_contexts(FD_SLOTS_INITIAL);
        iom.scheduler.start();
        iom
    }

    /// I/O manager driving the current worker thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|cell| cell.borrow().upgrade())
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Number of armed (fd, direction) continuations
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Current fd context table capacity
    pub fn context_capacity(&self) -> usize {
        self.fd_contexts.read().unwrap().len()
    }

    /// Drain the scheduler and release the worker pool
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    fn grow_contexts(&self, size: usize) {
        let mut table = self.fd_contexts.write().unwrap();
        let mut fd = table.len() as RawFd;
        while table.len() < size {
            table.push(Arc::new(FdContext::new(fd)));
            fd += 1;
        }
    }

    /// Look up an fd context, growing the table to 1.5x the fd on miss
    /// when `create` is set.
    fn fd_context(&self, fd: RawFd, create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        {
            let table = self.fd_contexts.read().unwrap();
            if let Some(ctx) = table.get(fd as usize) {
                return Some(ctx.clone());
            }
        }
        if !create {
            return None;
        }
        let target = ((fd as usize) * 3).div_ceil(2).max(fd as usize + 1);
        self.grow_contexts(target);
        Some(self.fd_contexts.read().unwrap()[fd as usize].clone())
    }

    /// Arm `event` on `fd`
    ///
    /// With `cb`, the continuation is the callback; otherwise it is the
    /// current fiber, which must be RUNNING and about to yield on its own
    /// stack. Arming an already-armed direction fails and leaves the
    /// first arming in effect.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> SchedResult<()> {
        let ctx = self.fd_context(fd, true).ok_or(SchedError::FdNotFound)?;
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events & event.bit() != 0 {
            return Err(SchedError::EventExists);
        }

        let op = if inner.events == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | inner.events | event.bit(),
            u64: Arc::as_ptr(&ctx) as usize as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            kerror!("add_event: epoll_ctl({}) failed: {}", fd, err);
            return Err(SchedError::PlatformError(err.raw_os_error().unwrap_or(0)));
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events |= event.bit();

        let scheduler = Arc::downgrade(&self.scheduler);
        let slot = inner.slot_mut(event);
        debug_assert!(slot.task.is_none());
        slot.scheduler = scheduler;
        slot.task = Some(match cb {
            Some(cb) => TaskPayload::Call(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(fiber.state(), FiberState::Running);
                TaskPayload::Fiber(fiber)
            }
        });
        Ok(())
    }

    /// Disarm `event` on `fd` without firing its continuation
    pub fn del_event(&self, fd: RawFd, event: Event) -> SchedResult<()> {
        let ctx = self.fd_context(fd, false).ok_or(SchedError::FdNotFound)?;
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events & event.bit() == 0 {
            return Err(SchedError::EventNotFound);
        }

        let remaining = inner.events & !event.bit();
        self.reregister(fd, remaining, Arc::as_ptr(&ctx) as usize as u64)?;
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.events = remaining;
        let slot = inner.slot_mut(event);
        slot.task = None;
        slot.scheduler = Weak::new();
        Ok(())
    }

    /// Disarm `event` on `fd` and fire its continuation (as cancellation)
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> SchedResult<()> {
        let ctx = self.fd_context(fd, false).ok_or(SchedError::FdNotFound)?;
        let fired = {
            let mut inner = ctx.inner.lock().unwrap();

            if inner.events & event.bit() == 0 {
                return Err(SchedError::EventNotFound);
            }

            let remaining = inner.events & !event.bit();
            self.reregister(fd, remaining, Arc::as_ptr(&ctx) as usize as u64)?;
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
            inner.events = remaining;
            inner.slot_mut(event).take()
        };
        // fd lock released before submission reacquires the queue lock
        if let Some((scheduler, task)) = fired {
            if let Some(s) = scheduler.upgrade() {
                s.submit(task, None);
            }
        }
        Ok(())
    }

    /// Unregister `fd` entirely and fire both directions' continuations
    pub fn cancel_all(&self, fd: RawFd) -> SchedResult<()> {
        let ctx = self.fd_context(fd, false).ok_or(SchedError::FdNotFound)?;
        let fired = {
            let mut inner = ctx.inner.lock().unwrap();

            if inner.events == 0 {
                return Err(SchedError::EventNotFound);
            }

            let rt = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rt != 0 {
                let err = io::Error::last_os_error();
                kerror!("cancel_all: epoll_ctl({}) failed: {}", fd, err);
                return Err(SchedError::PlatformError(err.raw_os_error().unwrap_or(0)));
            }

            let mut fired = Vec::with_capacity(2);
            if inner.events & Event::Read.bit() != 0 {
                if let Some(t) = inner.read.take() {
                    fired.push(t);
                }
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            if inner.events & Event::Write.bit() != 0 {
                if let Some(t) = inner.write.take() {
                    fired.push(t);
                }
                self.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            inner.events = 0;
            fired
        };
        for (scheduler, task) in fired {
            if let Some(s) = scheduler.upgrade() {
                s.submit(task, None);
            }
        }
        Ok(())
    }

    /// Update the kernel registration to `mask` (DEL when empty)
    fn reregister(&self, fd: RawFd, mask: u32, userdata: u64) -> SchedResult<()> {
        let op = if mask != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | mask,
            u64: userdata,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            kerror!("epoll_ctl({}) failed: {}", fd, err);
            return Err(SchedError::PlatformError(err.raw_os_error().unwrap_or(0)));
        }
        Ok(())
    }

    /// Expose a weak handle (for timeout callbacks in the hook layer)
    pub fn weak(&self) -> Weak<IoManager> {
        self.self_weak.clone()
    }
}

impl Reactor for IoManager {
    /// Wake the readiness wait; a no-op unless some worker is idle
    fn tickle(&self) {
        if self.scheduler.idle_workers() == 0 {
            return;
        }
        // A full pipe already guarantees a pending wake
        let _ = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1) };
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.base_stopping()
    }

    fn on_thread_start(&self) {
        CURRENT_IO.with(|cell| *cell.borrow_mut() = self.self_weak.clone());
        crate::hook::set_hook_enable(true);
    }

    /// Per-worker idle loop: readiness wait bounded by the next timer
    /// deadline, timer drain, event dispatch, then yield back to the
    /// worker loop so it can run the newly queued continuations.
    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];

        loop {
            if self.stopping() {
                kdebug!("io idle exiting");
                break;
            }

            let n = loop {
                let timeout = self.timers.next_delay_ms().min(MAX_IDLE_WAIT_MS);
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        EVENT_BATCH as i32,
                        timeout as i32,
                    )
                };
                if rt < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    panic!("epoll_wait failed: {}", err);
                }
                break rt as usize;
            };

            // Expired timers become ordinary tasks on this scheduler
            for cb in self.timers.drain_expired() {
                self.scheduler.submit_call(move || cb(), None);
            }

            for i in 0..n {
                let reported = events[i].events;
                let userdata = events[i].u64;

                if userdata == 0 {
                    // self-pipe: edge-triggered, must exhaust
                    let mut buf = [0u8; 256];
                    loop {
                        let r = unsafe {
                            libc::read(
                                self.tickle_fds[0],
                                buf.as_mut_ptr() as *mut libc::c_void,
                                buf.len(),
                            )
                        };
                        if r <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let ctx = unsafe { &*(userdata as usize as *const FdContext) };
                let fired = {
                    let mut inner = ctx.inner.lock().unwrap();

                    // Error/hangup wakes whichever directions are armed
                    let mut revents = reported;
                    if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                        revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events;
                    }
                    let real = inner.events & revents & (Event::Read.bit() | Event::Write.bit());
                    if real == 0 {
                        // canceled concurrently; late readiness is discarded
                        continue;
                    }

                    let remaining = inner.events & !real;
                    if self.reregister(ctx.fd, remaining, userdata).is_err() {
                        continue;
                    }
                    inner.events = remaining;

                    let mut fired = Vec::with_capacity(2);
                    if real & Event::Read.bit() != 0 {
                        if let Some(t) = inner.read.take() {
                            fired.push(t);
                        }
                        self.pending_events.fetch_sub(1, Ordering::SeqCst);
                    }
                    if real & Event::Write.bit() != 0 {
                        if let Some(t) = inner.write.take() {
                            fired.push(t);
                        }
                        self.pending_events.fetch_sub(1, Ordering::SeqCst);
                    }
                    fired
                };
                for (scheduler, task) in fired {
                    if let Some(s) = scheduler.upgrade() {
                        s.submit(task, None);
                    }
                }
            }

            Fiber::yield_now();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold strong handles, so by the time the last one drops
        // the pool has already been stopped.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_bits_match_kernel() {
        assert_eq!(Event::Read.bit(), libc::EPOLLIN as u32);
        assert_eq!(Event::Write.bit(), libc::EPOLLOUT as u32);
    }
}
