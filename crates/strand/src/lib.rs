//! # strand - Cooperative Fiber Runtime
//!
//! Multiplexes many stackful fibers over a small pool of OS threads, with
//! an epoll readiness poller and an absolute-deadline timer set wired into
//! the scheduler so fibers can wait for fd events or timeouts without
//! holding a thread.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{EventSet, Fiber, IoManager};
//!
//! fn main() {
//!     let io = IoManager::new(2, false, "app").unwrap();
//!
//!     io.schedule(|| println!("hello from a fiber"), None);
//!
//!     // Wait for readability, cooperatively.
//!     io.schedule(move || {
//!         // io.add_event(fd, EventSet::READ, None).unwrap();
//!         // Fiber::yield_now();           // resumed when fd is readable
//!     }, None);
//!
//!     io.add_timer(100, || println!("100 ms later"), false);
//!
//!     io.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      User Code                          │
//! │        schedule(), add_event(), add_timer()             │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Scheduler                           │
//! │        task queue, pinning, worker coordination         │
//! └─────────────────────────────────────────────────────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!      ┌──────────┐       ┌──────────┐       ┌──────────┐
//!      │  Worker  │  ...  │  Worker  │       │ idle:    │
//!      │  Thread  │       │  Thread  │       │ epoll +  │
//!      └──────────┘       └──────────┘       │ timers   │
//!            │                  │            └──────────┘
//!            └──────────────────┴───── resume ────┘
//!                           │
//!                           ▼
//!      ┌─────────────────────────────────────────────┐
//!      │      Fibers: guard-paged stacks, ~20ns      │
//!      │         voluntary context switches          │
//!      └─────────────────────────────────────────────┘
//! ```
//!
//! Workers with nothing to run block in `epoll_wait` inside a per-worker
//! idle fiber; fd readiness, expired timers and cross-thread tickles (a
//! byte on a self-pipe) all funnel back into the shared task queue.

// Core types
pub use strand_core::{
    env_get, env_get_bool, env_get_opt, next_fiber_id, FiberId, FiberState, LogLevel, RtError,
    RtResult, Semaphore,
};

// Logging macros and their runtime switches
pub use strand_core::{sdebug, serror, sinfo, sprintln, strace, swarn};
pub use strand_core::sprint::{init as init_logging, set_flush_enabled, set_log_level};

// Runtime types
pub use strand_runtime::{
    EventSet, Fiber, FiberFn, IoManager, OsThread, Pid, Scheduler, SchedulerOptions, Task, Timer,
    TimerCallback, TimerManager, NO_TIMEOUT,
};

/// Yield the current fiber back to its scheduler.
///
/// Off-fiber this degrades to an OS-level thread yield.
#[inline]
pub fn yield_now() {
    Fiber::yield_now();
}

/// Id of the fiber the calling thread is running, `FiberId::NONE` off-fiber.
#[inline]
pub fn current_fiber_id() -> FiberId {
    Fiber::current_id()
}
