//! x86_64 context switching implementation
//!
//! Uses inline assembly for the voluntary switch.
//! Stable in Rust 1.88+

use std::arch::naked_asm;

/// Callee-saved register state for a suspended fiber
///
/// Offsets are referenced from assembly; keep layout in sync with
/// `context_switch`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FiberContext {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl FiberContext {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a new fiber's context
///
/// Sets up the stack so that when switched to, execution begins at the
/// trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `ctx` must point to valid FiberContext memory.
/// `stack_top` must be the high end of a valid stack mapping.
#[inline]
pub unsafe fn init_context(
    ctx: *mut FiberContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // Stack must be 16-byte aligned per System V AMD64 ABI
    let sp = stack_top as usize;

    // Align to 16 bytes, then subtract 8 for the "call" alignment
    let aligned_sp = (sp & !0xF) - 8;

    let ctx = unsafe { &mut *ctx };
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64; // Entry function
    ctx.r13 = entry_arg as u64; // Entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument
///
/// After the entry function returns, the finish routine marks the fiber
/// TERM and switches back to the host; it never returns here.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "call {finish}",
        "ud2",
        finish = sym crate::fiber::fiber_finished,
    );
}

/// Perform a voluntary context switch
///
/// Saves callee-saved registers to `save` and loads from `load`.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _save: *mut FiberContext,
    _load: *const FiberContext,
) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for saved context
        "1:",
        "ret",
    );
}
