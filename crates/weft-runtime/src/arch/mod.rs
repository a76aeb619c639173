//! Architecture-specific context switching

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{FiberContext, context_switch, fiber_trampoline, init_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{FiberContext, context_switch, fiber_trampoline, init_context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
