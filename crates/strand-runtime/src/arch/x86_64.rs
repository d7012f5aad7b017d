//! x86_64 context switching
//!
//! Inline assembly via `naked_asm`, stable since Rust 1.88.

use std::arch::naked_asm;

/// Saved register state for a suspended fiber.
///
/// System V AMD64: rbx, rbp, r12-r15 are callee-saved and must survive a
/// call boundary; together with rsp and the resume address they are the
/// whole context a cooperative switch has to preserve.
#[repr(C)]
#[derive(Debug, Default)]
pub struct FiberContext {
    rsp: u64,
    rip: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Initialize a fresh fiber context.
///
/// The first switch into `ctx` starts the entry trampoline on the given
/// stack; the trampoline calls `entry`, which must never return.
///
/// # Safety
///
/// `ctx` must point to valid context memory and `stack_top` must be the
/// top (highest address) of a mapped stack region.
pub unsafe fn init_context(ctx: *mut FiberContext, stack_top: *mut u8, entry: usize) {
    // The ABI wants rsp 16-byte aligned at the `call` in the trampoline,
    // so the trampoline itself starts on a 16-byte boundary.
    let aligned_sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = 0;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Entry trampoline: call the entry function held in r12.
///
/// The entry function terminates the fiber by switching away; the `ud2`
/// only executes if that contract is broken.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!("call r12", "ud2");
}

/// Swap contexts: save callee-saved state into `old`, restore from `new`.
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// Both pointers must be valid. `new` must hold either a snapshot taken by
/// a previous switch or a fresh context from [`init_context`]. At most one
/// thread may be switching into a given context at a time.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut FiberContext, _new: *const FiberContext) {
    naked_asm!(
        // Save callee-saved registers into old (rdi); the resume point is
        // the local label below.
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Restore from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point for a context saved above: plain return into the
        // original caller of context_switch.
        "1:",
        "ret",
    );
}
