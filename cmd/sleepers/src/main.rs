//! Sleepers demo
//!
//! Submits fibers that sleep for different durations and prints the wake
//! order: fibers started in submission order, woken in deadline order.
//!
//! Usage:
//!     cargo run -p weft-sleepers

use weft_io::{hook, IoManager};

use std::time::Instant;

fn main() {
    let iom = IoManager::new(1, true, "sleepers");
    let start = Instant::now();

    for secs in [1u32, 3, 2] {
        let t0 = start;
        iom.scheduler().submit_call(
            move || {
                println!("[{:>5}ms] fiber sleeping {}s", t0.elapsed().as_millis(), secs);
                hook::sleep(secs);
                println!("[{:>5}ms] slept {}s", t0.elapsed().as_millis(), secs);
            },
            None,
        );
    }

    iom.stop();
    println!("[{:>5}ms] all sleepers done", start.elapsed().as_millis());
}
