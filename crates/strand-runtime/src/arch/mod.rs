//! Architecture-specific context switching
//!
//! A fiber context is the set of callee-saved registers plus the stack
//! pointer. Three operations are exposed:
//!
//! - [`init_context`]: prepare a fresh context so the first switch into it
//!   lands in an entry trampoline on the given stack
//! - [`context_switch`]: save the current registers into one context and
//!   restore from another
//! - the entry trampoline itself, which calls the runtime's fiber entry
//!   function and traps if it ever returns
//!
//! Everything above this module treats the context as opaque.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::{context_switch, init_context, FiberContext};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::{context_switch, init_context, FiberContext};
    } else {
        compile_error!("strand: unsupported architecture");
    }
}
