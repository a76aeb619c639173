//! Cooperative replacements for blocking fd syscalls
//!
//! Each function mirrors the libc signature. When the per-thread hook
//! switch is off, the fd is unknown, closed, not a socket, or the user
//! asked for non-blocking mode, the original call is made directly.
//! Otherwise the call is attempted non-blocking; on EAGAIN the direction
//! is armed with the I/O manager (plus a condition timer when the fd has
//! a timeout for that direction), the fiber yields, and the call is
//! retried on wakeup. Timed-out operations return -1 with ETIMEDOUT.
//!
//! Worker threads flip the switch on startup; unrelated threads keep the
//! original blocking behavior.

use crate::fd_manager::{fd_registry, TimeoutKind};
use crate::manager::{Event, IoManager};

use weft_core::constants::NO_TIMEOUT;
use weft_core::kerror;
use weft_runtime::{Fiber, TaskPayload};

use libc::{c_int, c_uint, c_void, size_t, sockaddr, socklen_t, ssize_t};

use std::any::Any;
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Enable or disable the hook for the current thread
pub fn set_hook_enable(on: bool) {
    HOOK_ENABLED.with(|cell| cell.set(on));
}

/// Whether the hook is enabled on the current thread
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: c_int) {
    unsafe { *libc::__errno_location() = e };
}

/// Shared between a suspended operation and its timeout timer
#[derive(Default)]
struct OpTracker {
    /// 0, or the errno the timer decided the operation fails with
    cancelled: AtomicI32,
}

/// Arm a condition timer that, on fire, marks the tracker ETIMEDOUT and
/// cancels the armed event (resuming the fiber as cancellation).
fn arm_timeout(
    iom: &Arc<IoManager>,
    tracker: &Arc<OpTracker>,
    fd: c_int,
    event: Event,
    timeout_ms: u64,
) -> Arc<weft_runtime::Timer> {
    let winfo = Arc::downgrade(tracker);
    let wmgr: Weak<IoManager> = iom.weak();
    let tracker_any: Arc<dyn Any + Send + Sync> = tracker.clone();
    let cond: Weak<dyn Any + Send + Sync> = Arc::downgrade(&tracker_any);
    iom.timers().add_condition_timer(
        timeout_ms,
        Arc::new(move || {
            let Some(info) = winfo.upgrade() else { return };
            info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
            if let Some(m) = wmgr.upgrade() {
                let _ = m.cancel_event(fd, event);
            }
        }),
        cond,
        false,
    )
}

/// Generic template behind read/write/recv/send/accept/...
///
/// `original` performs the raw call; EINTR is retried, EAGAIN suspends.
fn do_io<F>(fd: c_int, event: Event, kind: TimeoutKind, mut original: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !hook_enabled() {
        return original();
    }
    let Some(ctx) = fd_registry().get(fd, false) else {
        return original();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return original();
    }

    let timeout_ms = ctx.timeout(kind);
    let tracker = Arc::new(OpTracker::default());

    loop {
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }

        let mut n = original();
        while n == -1 && errno() == libc::EINTR {
            n = original();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            return original();
        };

        let timer = if timeout_ms != NO_TIMEOUT {
            Some(arm_timeout(&iom, &tracker, fd, event, timeout_ms))
        } else {
            None
        };

        match iom.add_event(fd, event, None) {
            Ok(()) => {
                Fiber::yield_now();
                // resumed: either readiness, timeout, or cancellation
                if let Some(t) = &timer {
                    t.cancel();
                }
                let c = tracker.cancelled.load(Ordering::SeqCst);
                if c != 0 {
                    set_errno(c);
                    return -1;
                }
            }
            Err(e) => {
                kerror!("hook: add_event({}, {:?}) failed: {}", fd, event, e);
                if let Some(t) = &timer {
                    t.cancel();
                }
                return -1;
            }
        }
    }
}

/// Suspend the current fiber for `ms` via the timer manager.
/// Returns false when the hook path is unavailable.
fn do_sleep_ms(ms: u64) -> bool {
    if !hook_enabled() {
        return false;
    }
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let Some(fiber) = Fiber::try_current() else {
        return false;
    };

    let scheduler = Arc::downgrade(iom.scheduler());
    iom.timers().add_timer(
        ms,
        Arc::new(move || {
            if let Some(s) = scheduler.upgrade() {
                s.submit(TaskPayload::Fiber(fiber.clone()), None);
            }
        }),
        false,
    );
    Fiber::yield_now();
    true
}

// ── sleep family ──

pub fn sleep(seconds: c_uint) -> c_uint {
    if do_sleep_ms(seconds as u64 * 1000) {
        0
    } else {
        unsafe { libc::sleep(seconds) }
    }
}

pub fn usleep(usec: c_uint) -> c_int {
    if do_sleep_ms(usec as u64 / 1000) {
        0
    } else {
        unsafe { libc::usleep(usec) }
    }
}

/// # Safety
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    let ms = unsafe { (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000 };
    if do_sleep_ms(ms) {
        0
    } else {
        unsafe { libc::nanosleep(req, rem) }
    }
}

// ── socket lifecycle ──

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if hook_enabled() && fd >= 0 {
        fd_registry().get(fd, true);
    }
    fd
}

/// connect with an explicit bound; `u64::MAX` waits unboundedly
///
/// # Safety
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = fd_registry().get(fd, false) else {
        return unsafe { libc::connect(fd, addr, addrlen) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    let Some(iom) = IoManager::current() else {
        return n;
    };
    let tracker = Arc::new(OpTracker::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        Some(arm_timeout(&iom, &tracker, fd, Event::Write, timeout_ms))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            if tracker.cancelled.load(Ordering::SeqCst) != 0 {
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
        }
        Err(e) => {
            kerror!("hook: connect add_event({}) failed: {}", fd, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return -1;
        }
    }

    // resolve the asynchronous connect's outcome
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut len,
        )
    };
    if rt == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// # Safety
/// `addr` must point to a valid sockaddr of length `addrlen`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    unsafe { connect_with_timeout(fd, addr, addrlen, NO_TIMEOUT) }
}

/// # Safety
/// `addr`/`addrlen` must be null or valid out-pointers.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let new_fd = do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if new_fd >= 0 && hook_enabled() {
        fd_registry().get(new_fd, true);
    }
    new_fd
}

// ── read side ──

/// # Safety
/// `buf` must be valid for writes of `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for writes of `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf, len, flags)
    })
}

/// # Safety
/// `buf` must be valid for writes of `len` bytes; addr pointers may be null.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Event::Read, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── write side ──

/// # Safety
/// `buf` must be valid for reads of `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for reads of `len` bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf, len, flags)
    })
}

/// # Safety
/// `buf` must be valid for reads of `len` bytes; `dest_addr` must be valid.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendto(fd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, Event::Write, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── close / flags / options ──

/// Cancels both directions (continuations fire as cancellation) and drops
/// the registry entry before the underlying close.
pub fn close(fd: c_int) -> c_int {
    if hook_enabled() {
        if let Some(ctx) = fd_registry().get(fd, false) {
            ctx.mark_closed();
            if let Some(iom) = IoManager::current() {
                let _ = iom.cancel_all(fd);
            }
            fd_registry().del(fd);
        }
    }
    unsafe { libc::close(fd) }
}

/// fcntl with an integer argument (covers F_GETFL/F_SETFL and friends).
/// The user-visible O_NONBLOCK flag is tracked independently of the
/// kernel flag the hook keeps forced on.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg;
            if let Some(ctx) = fd_registry().get(fd, false) {
                if ctx.is_init() && !ctx.is_closed() && ctx.is_socket() {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                }
            }
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags < 0 {
                return flags;
            }
            if let Some(ctx) = fd_registry().get(fd, false) {
                if ctx.is_init() && !ctx.is_closed() && ctx.is_socket() {
                    return if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    };
                }
            }
            flags
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// # Safety
/// `arg` must be valid for the request.
pub unsafe fn ioctl(fd: c_int, request: libc::c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as libc::c_ulong {
        let user_nonblock = unsafe { *(arg as *mut c_int) } != 0;
        if let Some(ctx) = fd_registry().get(fd, false) {
            if ctx.is_init() && !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/// # Safety
/// `optval`/`optlen` must be valid out-pointers.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// SO_RCVTIMEO/SO_SNDTIMEO are recorded so the I/O template can arm a
/// matching condition timer; a zero timeval disables the bound.
///
/// # Safety
/// `optval` must be valid for reads of `optlen` bytes.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_registry().get(fd, true) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_switch_is_per_thread() {
        assert!(!hook_enabled());
        set_hook_enable(true);
        assert!(hook_enabled());

        let other = std::thread::spawn(|| hook_enabled());
        assert!(!other.join().unwrap());
        set_hook_enable(false);
    }

    #[test]
    fn test_disabled_hook_passes_through() {
        set_hook_enable(false);
        let mut fds = [0 as c_int; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0);

        let payload = b"hi";
        let n = unsafe { write(fds[1], payload.as_ptr() as *const c_void, payload.len()) };
        assert_eq!(n, 2);
        let mut buf = [0u8; 8];
        let n = unsafe { read(fds[0], buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], payload);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_keeps_user_flag_independent() {
        set_hook_enable(true);
        let mut fds = [0 as c_int; 2];
        let rt = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rt, 0);

        // registering probes the socket and forces kernel O_NONBLOCK
        let ctx = fd_registry().get(fds[0], true).unwrap();
        assert!(ctx.sys_nonblock());

        // user did not ask for nonblocking: getter hides the kernel flag
        let flags = fcntl(fds[0], libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        // user opts in: getter reflects it, kernel flag stays forced
        let rt = fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        assert!(rt >= 0);
        assert!(ctx.user_nonblock());
        let flags = fcntl(fds[0], libc::F_GETFL, 0);
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        fd_registry().del(fds[0]);
        set_hook_enable(false);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
