//! Fibers: units of execution with their own stacks
//!
//! A fiber wraps a register context, a guard-paged stack, a one-shot
//! callback and a state. `resume` switches the calling thread into the
//! fiber; the fiber runs until it yields or its callback returns.
//!
//! Two fibers per thread adopt the native stack instead of owning one: the
//! thread's main fiber (created lazily on first access) and, on worker
//! threads, the scheduler fiber is simply the main fiber. A
//! caller-participating thread gets a dedicated scheduler fiber with its
//! own stack so the user's outer code keeps the native stack.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use strand_core::id::{next_fiber_id, FiberId};
use strand_core::state::FiberState;
use strand_core::{sdebug, serror};

use crate::arch::{context_switch, init_context, FiberContext};
use crate::config;
use crate::stack::Stack;
use crate::tls;

/// The callback a fiber runs to completion.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Live fiber gauge (constructed minus dropped), including main fibers.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: FiberId,
    /// None for fibers adopting the thread's native stack.
    stack: Option<Stack>,
    ctx: UnsafeCell<FiberContext>,
    cb: Mutex<Option<FiberFn>>,
    state: AtomicU8,
    /// Chooses the swap-back target on yield: the scheduler fiber when
    /// true, the thread's main fiber when false.
    run_in_scheduler: bool,
    /// Serializes resumption; the scheduler holds this across `resume`.
    pub lock: Mutex<()>,
    self_weak: Weak<Fiber>,
}

// Safety: the register context is only touched by the one OS thread that
// is switching into or out of this fiber. The Ready -> Running transition
// happens in `resume` under `lock`, and Ready is republished only after
// the previous runner's register save has completed (see `resume`), so two
// threads never race on `ctx`.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `cb` on its own stack.
    ///
    /// `stack_size == 0` selects the configured default. `run_in_scheduler`
    /// controls where `yield` lands: the scheduler fiber (tasks) or the
    /// thread's main fiber (the caller-thread scheduler fiber itself).
    pub fn new(cb: FiberFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::default_stack_size()
        } else {
            stack_size
        };
        let stack = Stack::new(size).expect("fiber stack allocation failed");

        let fiber = Arc::new_cyclic(|w| Fiber {
            id: next_fiber_id(),
            stack: Some(stack),
            ctx: UnsafeCell::new(FiberContext::default()),
            cb: Mutex::new(Some(cb)),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            lock: Mutex::new(()),
            self_weak: w.clone(),
        });
        unsafe {
            init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_entry as usize,
            );
        }
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        sdebug!("fiber {} created (stack {} bytes)", fiber.id, size);
        fiber
    }

    /// Main fiber for the current thread, adopting the native stack.
    fn new_main() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|w| Fiber {
            id: next_fiber_id(),
            stack: None,
            ctx: UnsafeCell::new(FiberContext::default()),
            cb: Mutex::new(None),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            lock: Mutex::new(()),
            self_weak: w.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Number of live fibers in the process (main fibers included).
    pub fn count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    fn ctx_ptr(&self) -> *mut FiberContext {
        self.ctx.get()
    }

    /// Rearm a finished fiber with a new callback, reusing its stack.
    ///
    /// Panics unless the fiber is TERM.
    pub fn reset(&self, cb: FiberFn) {
        let stack = self
            .stack
            .as_ref()
            .expect("reset on a fiber without its own stack");
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset requires a TERM fiber"
        );
        *self.cb.lock().unwrap() = Some(cb);
        unsafe {
            init_context(self.ctx.get(), stack.top(), fiber_entry as usize);
        }
        self.set_state(FiberState::Ready);
    }

    /// Switch the calling thread into this fiber.
    ///
    /// Panics unless the fiber is READY. Returns when the fiber yields
    /// (state READY again) or its callback returns (state TERM).
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume requires a READY fiber"
        );
        let me = self
            .self_weak
            .upgrade()
            .expect("resume on a fiber mid-teardown");
        let back = if self.run_in_scheduler {
            tls::scheduler_fiber().expect("resume of a scheduler task outside a scheduler thread")
        } else {
            Fiber::ensure_main()
        };
        self.set_state(FiberState::Running);
        tls::set_current_fiber(Some(me));
        unsafe {
            context_switch(back.ctx_ptr(), self.ctx_ptr());
        }
        // The fiber switched away. Its register save is complete (we are
        // running on the saved-into context), so a voluntary yield can be
        // published as READY now and not a moment earlier: anyone who saw
        // READY may immediately resume the fiber on another thread.
        if self.state() == FiberState::Running {
            self.set_state(FiberState::Ready);
        }
    }

    /// Yield the current fiber back to its scheduler.
    ///
    /// On a fiber, suspends it; the owning `resume` call returns. Off-fiber
    /// (or on a thread's main fiber) this degrades to an OS-level yield.
    pub fn yield_now() {
        let Some(cur) = tls::current_fiber() else {
            std::thread::yield_now();
            return;
        };
        if cur.stack.is_none() {
            // Main fibers have nothing to yield to.
            std::thread::yield_now();
            return;
        }
        cur.do_yield();
    }

    fn do_yield(&self) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield on a fiber that is not running"
        );
        let back = if self.run_in_scheduler {
            tls::scheduler_fiber().expect("yield of a scheduler task outside a scheduler thread")
        } else {
            Fiber::ensure_main()
        };
        tls::set_current_fiber(Some(back.clone()));
        // State stays RUNNING across the switch; the resumer republishes
        // READY once the save below has completed.
        unsafe {
            context_switch(self.ctx_ptr(), back.ctx_ptr());
        }
    }

    /// The calling thread's main fiber, created on first use.
    pub(crate) fn ensure_main() -> Arc<Fiber> {
        if let Some(main) = tls::main_fiber() {
            return main;
        }
        let main = Fiber::new_main();
        tls::set_main_fiber(Some(main.clone()));
        tls::set_current_fiber(Some(main.clone()));
        // Until a caller-participating scheduler installs a dedicated one,
        // yields land back on the thread fiber.
        if tls::scheduler_fiber().is_none() {
            tls::set_scheduler_fiber(Some(main.clone()));
        }
        main
    }

    /// The fiber currently executing on this thread (the main fiber is
    /// created lazily if none is).
    pub fn current() -> Arc<Fiber> {
        match tls::current_fiber() {
            Some(f) => f,
            None => Fiber::ensure_main(),
        }
    }

    /// Id of the current fiber, `FiberId::NONE` when off-fiber.
    pub fn current_id() -> FiberId {
        tls::current_fiber().map(|f| f.id()).unwrap_or(FiberId::NONE)
    }

    /// Install `f` as this thread's scheduler fiber.
    pub(crate) fn set_scheduler_fiber(f: &Arc<Fiber>) {
        tls::set_scheduler_fiber(Some(f.clone()));
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Runs on the fiber's own stack, entered from the arch trampoline.
///
/// Takes the callback out of its slot, runs it, marks the fiber TERM and
/// yields exactly once. Never returns: the closing switch leaves this
/// stack for good, and the trampoline traps if control ever comes back.
extern "C" fn fiber_entry() {
    let cur = tls::current_fiber().expect("fiber entry without a current fiber");

    let cb = cur.cb.lock().unwrap().take();
    if let Some(cb) = cb {
        // Unwinding across the switch boundary is undefined behaviour, so
        // a panicking callback takes the process down.
        if catch_unwind(AssertUnwindSafe(cb)).is_err() {
            serror!("fiber {} panicked; aborting", cur.id());
            std::process::abort();
        }
    }
    cur.set_state(FiberState::Term);

    let back = if cur.run_in_scheduler {
        tls::scheduler_fiber().expect("terminating fiber without a scheduler fiber")
    } else {
        Fiber::ensure_main()
    };
    tls::set_current_fiber(Some(back.clone()));

    let self_ctx = cur.ctx_ptr();
    let back_ctx = back.ctx_ptr();
    // Drop our handles before abandoning this stack; the resumer and the
    // thread-local anchors keep both fibers alive.
    drop(back);
    drop(cur);
    unsafe {
        context_switch(self_ctx, back_ctx);
    }
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_resume_runs_to_term() {
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        let f = Fiber::new(Box::new(move || {
            hit2.fetch_add(1, Ordering::SeqCst);
        }), 0, false);

        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_and_resume_again() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = steps.clone();
        let f = Fiber::new(Box::new(move || {
            steps2.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_now();
            steps2.fetch_add(1, Ordering::SeqCst);
        }), 0, false);

        f.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let f = Fiber::new(Box::new(move || {
            h1.fetch_add(1, Ordering::SeqCst);
        }), 0, false);
        f.resume();
        assert_eq!(f.state(), FiberState::Term);

        let h2 = hits.clone();
        f.reset(Box::new(move || {
            h2.fetch_add(10, Ordering::SeqCst);
        }));
        assert_eq!(f.state(), FiberState::Ready);
        f.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
        assert_eq!(f.state(), FiberState::Term);
    }

    #[test]
    fn test_current_id_on_and_off_fiber() {
        // Each test runs on a fresh thread: no fiber yet.
        assert!(Fiber::current_id().is_none());

        let seen = Arc::new(Mutex::new(FiberId::NONE));
        let seen2 = seen.clone();
        let f = Fiber::new(Box::new(move || {
            *seen2.lock().unwrap() = Fiber::current_id();
        }), 0, false);
        let expect = f.id();
        f.resume();
        assert_eq!(*seen.lock().unwrap(), expect);
    }

    #[test]
    fn test_fiber_count_gauge() {
        // The gauge is process-global and other tests run concurrently, so
        // only a lower bound is stable: our live fibers are counted.
        let held: Vec<_> = (0..3).map(|_| Fiber::new(Box::new(|| {}), 0, false)).collect();
        assert!(Fiber::count() >= held.len() as u64);
    }

    #[test]
    fn test_nested_fibers_interleave() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        let l2 = log.clone();

        let a = Fiber::new(Box::new(move || {
            l1.lock().unwrap().push("a1");
            Fiber::yield_now();
            l1.lock().unwrap().push("a2");
        }), 0, false);
        let b = Fiber::new(Box::new(move || {
            l2.lock().unwrap().push("b1");
            Fiber::yield_now();
            l2.lock().unwrap().push("b2");
        }), 0, false);

        a.resume();
        b.resume();
        a.resume();
        b.resume();

        assert_eq!(&*log.lock().unwrap(), &["a1", "b1", "a2", "b2"]);
    }
}
