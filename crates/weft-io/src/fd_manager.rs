//! Process-wide fd context registry
//!
//! Records, per fd: init status, socketness, kernel vs user non-blocking
//! flags and per-direction timeouts. Distinguishing the two non-blocking
//! flags lets the hook layer keep a socket kernel-nonblocking while the
//! user-visible flag tracks only what the user set via fcntl/ioctl.

use weft_core::constants::{FD_SLOTS_INITIAL, NO_TIMEOUT};

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Which per-direction timeout an operation consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-fd bookkeeping for the hook layer
pub struct FdCtx {
    fd: RawFd,
    is_init: AtomicBool,
    is_socket: AtomicBool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    is_closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> Self {
        let ctx = Self {
            fd,
            is_init: AtomicBool::new(false),
            is_socket: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        };
        ctx.init();
        ctx
    }

    /// Probe the fd: stat for socketness; sockets are forced
    /// kernel-nonblocking and that is recorded as hook-driven.
    fn init(&self) {
        if self.is_init.load(Ordering::Acquire) {
            return;
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } != 0 {
            return;
        }
        self.is_init.store(true, Ordering::Release);

        let is_socket = (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        self.is_socket.store(is_socket, Ordering::Release);
        if is_socket {
            let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            self.sys_nonblock.store(true, Ordering::Release);
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Timeout for one direction; `u64::MAX` means unbounded
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Sparse, growable table of fd contexts keyed by fd
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; FD_SLOTS_INITIAL]),
        }
    }

    /// Look up an fd, optionally constructing (and probing) its entry.
    /// The table grows to 1.5x the fd on miss.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return Some(ctx.clone());
            }
            if !auto_create {
                return None;
            }
        }
        let mut slots = self.slots.write().unwrap();
        if fd as usize >= slots.len() {
            let new_len = ((fd as usize) * 3).div_ceil(2).max(fd as usize + 1);
            slots.resize(new_len, None);
        }
        if slots[fd as usize].is_none() {
            slots[fd as usize] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[fd as usize].clone()
    }

    /// Drop the entry for `fd`
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();

/// The process-wide registry, lazily initialized
pub fn fd_registry() -> &'static FdRegistry {
    REGISTRY.get_or_init(FdRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_without_create() {
        let reg = FdRegistry::new();
        assert!(reg.get(5, false).is_none());
    }

    #[test]
    fn test_create_and_del() {
        let reg = FdRegistry::new();
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0);

        let ctx = reg.get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket()); // pipes are not sockets
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);

        reg.del(fds[0]);
        assert!(reg.get(fds[0], false).is_none());

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_probe_forces_nonblock() {
        let reg = FdRegistry::new();
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rt, 0);

        let ctx = reg.get(fds[0], true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_table_growth() {
        let reg = FdRegistry::new();
        let mut fds = [0 as RawFd; 2];
        let rt = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rt, 0);

        let high_fd = 200;
        let rt = unsafe { libc::dup2(fds[0], high_fd) };
        assert_eq!(rt, high_fd);

        assert!(reg.get(high_fd, true).is_some());
        assert!(reg.slots.read().unwrap().len() >= (high_fd as usize) * 3 / 2);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
            libc::close(high_fd);
        }
    }

    #[test]
    fn test_timeouts_roundtrip() {
        let reg = FdRegistry::new();
        let mut fds = [0 as RawFd; 2];
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };

        let ctx = reg.get(fds[0], true).unwrap();
        ctx.set_timeout(TimeoutKind::Recv, 200);
        ctx.set_timeout(TimeoutKind::Send, 300);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 200);
        assert_eq!(ctx.timeout(TimeoutKind::Send), 300);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
