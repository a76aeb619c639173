//! # weft-io
//!
//! The I/O side of the weft runtime:
//!
//! - `manager` - edge-triggered readiness engine over epoll, composed with
//!   the scheduler and timer manager
//! - `fd_manager` - process-wide fd context registry
//! - `hook` - cooperative replacements for blocking fd syscalls

pub mod fd_manager;
pub mod hook;
pub mod manager;

pub use fd_manager::{fd_registry, FdCtx, FdRegistry, TimeoutKind};
pub use manager::{Event, IoManager};
