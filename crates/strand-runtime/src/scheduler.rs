//! Multi-threaded fiber scheduler
//!
//! A worker pool draining a shared task queue. Tasks are fibers to resume
//! or one-shot callbacks (wrapped in a fresh fiber at dispatch). A task may
//! be pinned to one worker's OS thread id; unpinned tasks go to whichever
//! worker scans them first.
//!
//! With `use_caller` the constructing thread is itself one of the workers:
//! one fewer OS thread is spawned, and the constructing thread gets a
//! dedicated scheduler fiber so its main fiber can keep hosting the user's
//! outer code. That thread drains the queue inside `stop()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use strand_core::state::FiberState;
use strand_core::{sdebug, serror, strace};

use crate::config::SchedulerOptions;
use crate::fiber::{Fiber, FiberFn};
use crate::thread::{OsThread, Pid};
use crate::tls;

/// Payload of a scheduled task.
pub enum Task {
    /// An existing fiber to resume.
    Fiber(Arc<Fiber>),
    /// A one-shot callback, run on a fresh fiber.
    Call(FiberFn),
}

/// A queued task, optionally pinned to one worker's OS thread id.
pub(crate) struct ScheduleTask {
    payload: Task,
    thread: Option<Pid>,
}

/// Seam for subsystems that extend the scheduler (the IO manager).
///
/// Without hooks: `tickle` is a no-op, `idle` sleeps and yields,
/// `stopping` is the base condition.
pub(crate) trait SchedulerHooks: Send + Sync {
    fn tickle(&self);
    fn idle(&self);
    fn stopping(&self) -> bool;
    /// Recover the concrete IO manager behind the hooks, if that is what
    /// they are.
    fn as_io(self: Arc<Self>) -> Option<Arc<crate::io::IoManager>>;
}

pub struct Scheduler {
    name: String,
    opts: SchedulerOptions,
    queue: Mutex<VecDeque<ScheduleTask>>,
    workers: Mutex<Vec<OsThread>>,
    thread_ids: Mutex<Vec<Pid>>,
    /// Worker OS threads to spawn (a participating caller not included).
    thread_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    stopping: AtomicBool,
    stopped: AtomicBool,
    use_caller: bool,
    caller_tid: Pid,
    /// The constructing thread's dedicated scheduler fiber (use_caller).
    caller_fiber: Mutex<Option<Arc<Fiber>>>,
    hooks: OnceLock<Weak<dyn SchedulerHooks>>,
    self_weak: Weak<Scheduler>,
}

impl Scheduler {
    /// Create a scheduler with `threads >= 1` total workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_options(threads, use_caller, name, SchedulerOptions::default())
    }

    pub fn with_options(
        threads: usize,
        use_caller: bool,
        name: &str,
        opts: SchedulerOptions,
    ) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one thread");
        opts.validate().expect("invalid scheduler options");

        let caller_tid = if use_caller { OsThread::current_tid() } else { -1 };
        let sched = Arc::new_cyclic(|w| Scheduler {
            name: name.to_string(),
            opts,
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            thread_count: if use_caller { threads - 1 } else { threads },
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            use_caller,
            caller_tid,
            caller_fiber: Mutex::new(None),
            hooks: OnceLock::new(),
            self_weak: w.clone(),
        });

        if use_caller {
            assert!(
                tls::current_scheduler().upgrade().is_none(),
                "this thread already participates in a scheduler"
            );
            tls::set_current_scheduler(sched.self_weak.clone());
            tls::set_thread_name(name);
            Fiber::ensure_main();

            let w = sched.self_weak.clone();
            let sf = Fiber::new(
                Box::new(move || {
                    if let Some(s) = w.upgrade() {
                        s.run();
                    }
                }),
                sched.opts.stack_size,
                // Returns to the thread's main fiber when it finishes.
                false,
            );
            Fiber::set_scheduler_fiber(&sf);
            *sched.caller_fiber.lock().unwrap() = Some(sf);
            sched.thread_ids.lock().unwrap().push(caller_tid);
        }

        sdebug!(
            "scheduler {}: created ({} worker threads, use_caller={})",
            sched.name,
            sched.thread_count,
            use_caller
        );
        sched
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler the calling thread works for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler().upgrade()
    }

    /// OS thread ids of all workers (the caller first when it participates).
    /// Worker ids are present once `start()` has returned.
    pub fn thread_ids(&self) -> Vec<Pid> {
        self.thread_ids.lock().unwrap().clone()
    }

    #[inline]
    pub(crate) fn options(&self) -> &SchedulerOptions {
        &self.opts
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn install_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        let _ = self.hooks.set(hooks);
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.get().and_then(|w| w.upgrade())
    }

    pub(crate) fn hooks_io(&self) -> Option<Arc<crate::io::IoManager>> {
        self.hooks().and_then(|h| h.as_io())
    }

    /// Queue a one-shot callback; `thread` pins it to a worker tid.
    ///
    /// A task pinned to a tid that no worker owns stays queued forever;
    /// there is no external cancellation for queued tasks.
    pub fn schedule<F>(&self, cb: F, thread: Option<Pid>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(ScheduleTask {
            payload: Task::Call(Box::new(cb)),
            thread,
        });
    }

    /// Queue a fiber for resumption; `thread` pins it to a worker tid.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<Pid>) {
        self.schedule_task(ScheduleTask {
            payload: Task::Fiber(fiber),
            thread,
        });
    }

    pub(crate) fn schedule_task(&self, task: ScheduleTask) {
        let need_tickle = {
            let mut q = self.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawn the worker threads. Refuses after `stop()`.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if self.stopping.load(Ordering::SeqCst) {
            serror!("scheduler {}: start() refused, already stopping", self.name);
            return;
        }
        assert!(workers.is_empty(), "scheduler already started");

        for i in 0..self.thread_count {
            let w = self.self_weak.clone();
            let t = OsThread::spawn(&format!("{}_{}", self.name, i), move || {
                if let Some(s) = w.upgrade() {
                    s.run();
                }
            });
            self.thread_ids.lock().unwrap().push(t.tid());
            workers.push(t);
        }
        sdebug!(
            "scheduler {}: started {} workers",
            self.name,
            self.thread_count
        );
    }

    /// Request shutdown, drain on the caller (when participating), join
    /// all workers. Idempotent; later calls return immediately.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        sdebug!(
            "scheduler {}: stop() on thread {}",
            self.name,
            OsThread::current_tid()
        );
        self.stopping.store(true, Ordering::SeqCst);
        if self.use_caller {
            assert_eq!(
                OsThread::current_tid(),
                self.caller_tid,
                "stop() must run on the thread that constructed this scheduler"
            );
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }

        // Participating caller: run the worker loop here until it drains.
        let caller_fiber = self.caller_fiber.lock().unwrap().take();
        if let Some(sf) = caller_fiber {
            sf.resume();
        }

        let workers = {
            let mut w = self.workers.lock().unwrap();
            std::mem::take(&mut *w)
        };
        for t in workers {
            t.join();
        }
        sdebug!("scheduler {}: stopped", self.name);
    }

    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn worker_count(&self) -> usize {
        self.thread_count
    }

    /// Cross-thread wakeup; dispatches to the installed hooks.
    pub(crate) fn tickle(&self) {
        match self.hooks() {
            Some(h) => h.tickle(),
            None => strace!("scheduler {}: tickle (no-op)", self.name),
        }
    }

    /// True when shutdown has been requested and no work remains.
    pub fn stopping(&self) -> bool {
        match self.hooks() {
            Some(h) => h.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Stop requested, queue empty, nobody mid-task.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.queue.lock().unwrap().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    fn idle_entry(&self) {
        match self.hooks() {
            Some(h) => h.idle(),
            None => self.default_idle(),
        }
    }

    fn default_idle(&self) {
        while !self.stopping() {
            std::thread::sleep(self.opts.idle_interval);
            Fiber::yield_now();
        }
    }

    /// The worker loop. Runs on every worker thread, and on the caller's
    /// scheduler fiber during `stop()` when the caller participates.
    fn run(&self) {
        let tid = OsThread::current_tid();
        sdebug!("scheduler {}: run() on thread {}", self.name, tid);
        tls::set_current_scheduler(self.self_weak.clone());
        if !(self.use_caller && tid == self.caller_tid) {
            // Worker thread: its main fiber doubles as the scheduler fiber.
            Fiber::ensure_main();
        }

        let idle_weak = self.self_weak.clone();
        let idle_fiber = Fiber::new(
            Box::new(move || {
                if let Some(s) = idle_weak.upgrade() {
                    s.idle_entry();
                }
            }),
            self.opts.stack_size,
            true,
        );

        loop {
            let mut task: Option<ScheduleTask> = None;
            let mut tickle_me = false;
            {
                let mut q = self.queue.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    if let Some(pin) = q[i].thread {
                        if pin != tid {
                            // Pinned elsewhere; make sure its owner looks.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    task = q.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                if task.is_some() && i < q.len() {
                    // Work remains behind the task we took.
                    tickle_me = true;
                }
            }
            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.payload) {
                Some(Task::Fiber(f)) => {
                    if f.state() != FiberState::Term {
                        let _guard = f.lock.lock().unwrap();
                        // A fiber handed to us by a trigger can still be
                        // mid-switch on another worker; READY is published
                        // only once its register save has completed.
                        while f.state() == FiberState::Running {
                            std::hint::spin_loop();
                        }
                        f.resume();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Task::Call(cb)) => {
                    let f = Fiber::new(cb, self.opts.stack_size, true);
                    {
                        let _guard = f.lock.lock().unwrap();
                        f.resume();
                    }
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == FiberState::Term {
                        sdebug!("scheduler {}: run() ends on thread {}", self.name, tid);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Workers hold strong references, so by the time drop runs they
        // have either exited or were never spawned.
        debug_assert!(
            self.stopped.load(Ordering::SeqCst) || self.workers.get_mut().unwrap().is_empty(),
            "scheduler dropped while running"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_opts() -> SchedulerOptions {
        SchedulerOptions::new().idle_interval(Duration::from_millis(2))
    }

    #[test]
    fn test_fifo_single_worker() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sched = Scheduler::with_options(1, false, "fifo", fast_opts());

        let o1 = out.clone();
        let o2 = out.clone();
        sched.schedule(move || o1.lock().unwrap().push(1), None);
        sched.schedule(move || o2.lock().unwrap().push(2), None);

        sched.start();
        sched.stop();

        assert_eq!(&*out.lock().unwrap(), &[1, 2]);
    }

    #[test]
    fn test_queue_empty_after_stop() {
        let sched = Scheduler::with_options(2, false, "drain", fast_opts());
        for i in 0..20 {
            sched.schedule(
                move || {
                    std::hint::black_box(i);
                },
                None,
            );
        }
        sched.start();
        sched.stop();
        assert!(sched.queue.lock().unwrap().is_empty());
        assert_eq!(sched.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pinned_task_runs_on_its_worker() {
        let sched = Scheduler::with_options(2, false, "pinned", fast_opts());
        sched.start();

        let ids = sched.thread_ids();
        assert_eq!(ids.len(), 2);
        let target = ids[0];

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        sched.schedule(
            move || {
                *seen2.lock().unwrap() = Some(OsThread::current_tid());
            },
            Some(target),
        );
        for i in 0..20 {
            sched.schedule(
                move || {
                    std::hint::black_box(i);
                },
                None,
            );
        }

        sched.stop();
        assert_eq!(*seen.lock().unwrap(), Some(target));
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let o1 = out.clone();
        let o2 = out.clone();

        let sched = Scheduler::with_options(1, true, "caller", fast_opts());
        // One thread total and use_caller: no OS threads are spawned.
        assert_eq!(sched.worker_count(), 0);

        sched.schedule(move || o1.lock().unwrap().push("a"), None);
        sched.schedule(move || o2.lock().unwrap().push("b"), None);
        sched.start();
        sched.stop();

        assert_eq!(&*out.lock().unwrap(), &["a", "b"]);
    }

    #[test]
    fn test_scheduled_fiber_is_resumed() {
        let hit = Arc::new(AtomicBool::new(false));
        let hit2 = hit.clone();
        let f = Fiber::new(
            Box::new(move || {
                hit2.store(true, Ordering::SeqCst);
            }),
            0,
            true,
        );

        let sched = Scheduler::with_options(1, false, "fibers", fast_opts());
        sched.schedule_fiber(f, None);
        sched.start();
        sched.stop();
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let sched = Scheduler::with_options(1, false, "twice", fast_opts());
        sched.start();
        sched.stop();
        sched.stop();
    }

    #[test]
    fn test_current_scheduler_inside_task() {
        let sched = Scheduler::with_options(1, false, "tls", fast_opts());
        let name = Arc::new(Mutex::new(String::new()));
        let name2 = name.clone();
        sched.schedule(
            move || {
                if let Some(s) = Scheduler::current() {
                    *name2.lock().unwrap() = s.name().to_string();
                }
            },
            None,
        );
        sched.start();
        sched.stop();
        assert_eq!(&*name.lock().unwrap(), "tls");
    }
}
