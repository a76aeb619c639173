//! Weft Echo Server
//!
//! TCP echo server written as if every call blocked: one fiber per
//! connection, straight-line read/write. The hook layer turns each
//! would-block call into a suspension, so a handful of workers carry
//! many connections.
//!
//! Usage:
//!     cargo run --release -p weft-echo [port] [workers]
//!
//! Test with:
//!     echo "hello" | nc localhost 9900

use anyhow::{Context, Result};
use weft_core::kerror;
use weft_io::{fd_registry, hook, IoManager};
use weft_runtime::scheduler;

use libc::{c_int, c_void};

const BUF_SIZE: usize = 4096;

fn listen_on(port: u16) -> Result<c_int> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    anyhow::ensure!(fd >= 0, "socket() failed");

    let one: c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const c_int as *const c_void,
            std::mem::size_of::<c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
    addr.sin_port = port.to_be();
    let rt = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    anyhow::ensure!(rt == 0, "bind(:{}) failed", port);

    let rt = unsafe { libc::listen(fd, 128) };
    anyhow::ensure!(rt == 0, "listen() failed");
    Ok(fd)
}

/// One fiber per connection: echo until EOF
fn serve(fd: c_int) {
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = unsafe { hook::read(fd, buf.as_mut_ptr() as *mut c_void, BUF_SIZE) };
        if n <= 0 {
            break;
        }
        let mut sent = 0usize;
        while sent < n as usize {
            let w = unsafe {
                hook::write(fd, buf[sent..].as_ptr() as *const c_void, n as usize - sent)
            };
            if w <= 0 {
                hook::close(fd);
                return;
            }
            sent += w as usize;
        }
    }
    hook::close(fd);
}

fn accept_loop(listener: c_int) {
    fd_registry().get(listener, true);
    loop {
        let fd = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            kerror!("accept failed on fd {}", listener);
            break;
        }
        let sched = scheduler::current_scheduler().expect("accept loop off a worker");
        sched.submit_call(move || serve(fd), None);
    }
}

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let port: u16 = args
        .next()
        .unwrap_or_else(|| "9900".to_string())
        .parse()
        .context("invalid port")?;
    let workers: usize = args
        .next()
        .unwrap_or_else(|| "2".to_string())
        .parse()
        .context("invalid worker count")?;

    let listener = listen_on(port)?;
    eprintln!("weft-echo: listening on :{} with {} workers", port, workers);

    let iom = IoManager::new(workers, true, "echo");
    iom.scheduler().submit_call(move || accept_loop(listener), None);

    // The caller thread joins the pool; this returns only when the
    // accept loop ends and all connections drain.
    iom.stop();
    Ok(())
}
