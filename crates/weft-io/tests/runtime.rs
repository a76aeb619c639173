//! End-to-end scenarios: sleep ordering, timeouts, accept/connect,
//! close cancellation, FIFO dispatch and affinity pinning.
//!
//! Each test owns its manager; worker pools never outlive a test.

use weft_core::SchedError;
use weft_io::{fd_registry, hook, Event, IoManager, TimeoutKind};
use weft_runtime::scheduler;

use libc::{c_int, c_void};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

fn socketpair() -> (c_int, c_int) {
    let mut fds = [0 as c_int; 2];
    let rt = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rt, 0);
    (fds[0], fds[1])
}

/// Wait (bounded) until `cond` holds
fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn sleep_wake_ordering() {
    // One worker, caller participates: everything drains inside stop()
    let iom = IoManager::new(1, true, "sleep-order");
    let order = Arc::new(Mutex::new(Vec::new()));

    for delay_ms in [100u32, 300, 200] {
        let order = order.clone();
        iom.scheduler().submit_call(
            move || {
                hook::usleep(delay_ms * 1000);
                order.lock().unwrap().push(delay_ms);
            },
            None,
        );
    }

    iom.stop();
    assert_eq!(*order.lock().unwrap(), vec![100, 200, 300]);
}

#[test]
fn recv_times_out_on_silent_peer() {
    let iom = IoManager::new(2, false, "recv-timeout");
    let (tx, rx) = mpsc::channel();

    iom.scheduler().submit_call(
        move || {
            let (rd, wr) = socketpair();
            let ctx = fd_registry().get(rd, true).unwrap();
            ctx.set_timeout(TimeoutKind::Recv, 200);

            let start = Instant::now();
            let mut buf = [0u8; 16];
            let n = unsafe { hook::recv(rd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
            let err = errno();
            let elapsed = start.elapsed();

            fd_registry().del(rd);
            unsafe {
                libc::close(rd);
                libc::close(wr);
            }
            tx.send((n, err, elapsed)).unwrap();
        },
        None,
    );

    let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(180), "woke early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "woke late: {:?}", elapsed);
    assert_eq!(iom.pending_events(), 0);
    iom.stop();
}

#[test]
fn accept_resumes_on_client_connect() {
    let iom = IoManager::new(2, false, "accept-connect");

    // Listener prepared outside the pool; the hook probe makes it
    // non-blocking when the accepting fiber registers it.
    let listener = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(listener >= 0);
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::to_be(0x7f00_0001); // 127.0.0.1
    addr.sin_port = 0;
    let rt = unsafe {
        libc::bind(
            listener,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert_eq!(rt, 0);
    let rt = unsafe { libc::listen(listener, 16) };
    assert_eq!(rt, 0);

    let mut bound: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockname(
            listener,
            &mut bound as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    assert_eq!(rt, 0);

    let (acc_tx, acc_rx) = mpsc::channel();
    let (con_tx, con_rx) = mpsc::channel();

    iom.scheduler().submit_call(
        move || {
            fd_registry().get(listener, true);
            let fd = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            acc_tx.send(fd).unwrap();
        },
        None,
    );

    iom.scheduler().submit_call(
        move || {
            let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            let rt = unsafe {
                hook::connect(
                    fd,
                    &bound as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            con_tx.send((fd, rt)).unwrap();
        },
        None,
    );

    let accepted = acc_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let (client, connect_rt) = con_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(accepted >= 0);
    assert_eq!(connect_rt, 0);
    assert_eq!(iom.pending_events(), 0);

    fd_registry().del(listener);
    fd_registry().del(client);
    fd_registry().del(accepted);
    unsafe {
        libc::close(accepted);
        libc::close(client);
        libc::close(listener);
    }
    iom.stop();
}

#[test]
fn close_cancels_suspended_reader() {
    let iom = IoManager::new(2, false, "close-cancel");
    let (rd, wr) = socketpair();
    fd_registry().get(rd, true);

    let (tx, rx) = mpsc::channel();
    iom.scheduler().submit_call(
        move || {
            let mut buf = [0u8; 16];
            let n = unsafe { hook::read(rd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            tx.send((n, errno())).unwrap();
        },
        None,
    );

    iom.scheduler().submit_call(
        move || {
            // give the reader time to park itself on READ
            hook::usleep(100_000);
            hook::close(rd);
        },
        None,
    );

    let (n, err) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::EBADF);
    assert_eq!(iom.pending_events(), 0);

    unsafe {
        libc::close(wr);
    }
    iom.stop();
}

#[test]
fn mass_submission_stays_fifo() {
    let iom = IoManager::new(1, false, "fifo");
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        iom.scheduler().submit_call(
            move || {
                order.lock().unwrap().push(i);
            },
            None,
        );
    }

    wait_until(|| order.lock().unwrap().len() == 100);
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    iom.stop();
}

#[test]
fn affinity_pins_to_one_worker() {
    let iom = IoManager::new(2, false, "affinity");
    let seen = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..10 {
        let seen = seen.clone();
        iom.scheduler().submit_call(
            move || {
                seen.lock().unwrap().push(scheduler::current_worker_id());
            },
            Some(0),
        );
    }

    wait_until(|| seen.lock().unwrap().len() == 10);
    for id in seen.lock().unwrap().iter() {
        assert_eq!(*id, Some(0));
    }
    iom.stop();
}

#[test]
fn arm_disarm_roundtrip_restores_state() {
    let iom = IoManager::new(1, false, "arm-disarm");
    let (rd, wr) = socketpair();
    let baseline = iom.pending_events();

    let hits = Arc::new(AtomicUsize::new(0));

    // arm with a callback continuation; nothing is readable, so only
    // cancel can fire it
    let h = hits.clone();
    iom.add_event(
        rd,
        Event::Read,
        Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    assert_eq!(iom.pending_events(), baseline + 1);

    // second arming of the same direction fails, first stays in effect
    let err = iom.add_event(rd, Event::Read, Some(Box::new(|| {}))).unwrap_err();
    assert!(matches!(err, SchedError::EventExists));
    assert_eq!(iom.pending_events(), baseline + 1);

    // del does not fire the continuation
    iom.del_event(rd, Event::Read).unwrap();
    assert_eq!(iom.pending_events(), baseline);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // cancel fires it exactly once
    let h = hits.clone();
    iom.add_event(
        rd,
        Event::Read,
        Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    iom.cancel_event(rd, Event::Read).unwrap();
    wait_until(|| hits.load(Ordering::SeqCst) == 1);
    assert_eq!(iom.pending_events(), baseline);

    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
    iom.stop();
}

#[test]
fn fd_table_grows_to_one_point_five_times_fd() {
    let iom = IoManager::new(1, false, "growth");
    let (rd, wr) = socketpair();

    let high_fd = 300;
    let rt = unsafe { libc::dup2(rd, high_fd) };
    assert_eq!(rt, high_fd);
    assert!(iom.context_capacity() < high_fd as usize);

    iom.add_event(high_fd, Event::Write, Some(Box::new(|| {}))).unwrap();
    assert!(iom.context_capacity() >= (high_fd as usize) * 3 / 2);

    // a write-ready socket fires promptly, emptying the pending set
    wait_until(|| iom.pending_events() == 0);

    unsafe {
        libc::close(high_fd);
        libc::close(rd);
        libc::close(wr);
    }
    iom.stop();
}
