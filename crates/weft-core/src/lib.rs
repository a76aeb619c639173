//! # weft-core
//!
//! Core types for the weft fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Context switching, scheduling and I/O live in `weft-runtime` and
//! `weft-io`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber state enum
//! - `error` - Error types
//! - `env` - Environment variable utilities
//! - `kprint` - Leveled, worker-tagged stderr logging
//! - `constants` - Runtime-wide tunables (inline below)

pub mod env;
pub mod error;
pub mod id;
pub mod kprint;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use error::{SchedError, SchedResult};
pub use id::FiberId;
pub use state::FiberState;

/// Runtime-wide constants
pub mod constants {
    /// Default fiber stack size (128 KiB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Guard page size at the low end of each fiber stack
    pub const GUARD_SIZE: usize = 4096;

    /// Maximum readiness events drained per epoll_wait
    pub const EVENT_BATCH: usize = 256;

    /// Upper bound on the idle fiber's readiness wait (ms)
    pub const MAX_IDLE_WAIT_MS: u64 = 5000;

    /// Initial fd context table capacity
    pub const FD_SLOTS_INITIAL: usize = 64;

    /// A wall-clock jump further back than this is treated as rollback
    pub const CLOCK_ROLLBACK_GUARD_MS: u64 = 60 * 60 * 1000;

    /// Sentinel for "no timeout configured"
    pub const NO_TIMEOUT: u64 = u64::MAX;
}
