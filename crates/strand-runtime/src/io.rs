//! Readiness-driven IO scheduling
//!
//! `IoManager` extends the scheduler with an epoll demultiplexer and the
//! timer set. Workers that run out of tasks block in `epoll_wait` inside
//! their idle fiber instead of sleeping; fd readiness and expired timers
//! turn into ordinary scheduled tasks. A self-pipe registered with the
//! poller is the cross-thread tickle: one byte ends an in-flight wait.
//!
//! Registrations are one-shot with respect to the poller: when a direction
//! fires (or is cancelled) its waiter is scheduled exactly once and the
//! direction returns to the unregistered state. Callers re-register to
//! wait again.

use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;

use strand_core::error::{RtError, RtResult};
use strand_core::state::FiberState;
use strand_core::{sdebug, serror, swarn};

use crate::config::SchedulerOptions;
use crate::fiber::{Fiber, FiberFn};
use crate::scheduler::{Scheduler, SchedulerHooks};
use crate::thread::OsThread;
use crate::timer::{Timer, TimerCallback, TimerManager, NO_TIMEOUT};

bitflags! {
    /// Waitable directions for a file descriptor.
    ///
    /// Bit-compatible with `EPOLLIN`/`EPOLLOUT` so the mask can go into the
    /// poller unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventSet: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

impl EventSet {
    /// No direction registered.
    pub const NONE: EventSet = EventSet::empty();
}

/// Resumption target for one direction of one fd.
///
/// The scheduler reference is snapshotted at registration so the trigger
/// lands on the same scheduler even if the current thread's changes.
struct EventSlot {
    scheduler: Weak<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventSlot {
    fn new() -> Self {
        EventSlot {
            scheduler: Weak::new(),
            fiber: None,
            cb: None,
        }
    }

    fn clear(&mut self) {
        self.scheduler = Weak::new();
        self.fiber = None;
        self.cb = None;
    }
}

struct FdState {
    events: EventSet,
    read: EventSlot,
    write: EventSlot,
}

impl FdState {
    fn slot_mut(&mut self, ev: EventSet) -> &mut EventSlot {
        if ev == EventSet::READ {
            &mut self.read
        } else if ev == EventSet::WRITE {
            &mut self.write
        } else {
            unreachable!("slot lookup needs exactly one direction")
        }
    }

    /// Unregister `ev` and schedule its waiter exactly once.
    fn trigger(&mut self, ev: EventSet) {
        assert!(self.events.contains(ev), "trigger on unregistered direction");
        self.events -= ev;

        let slot = self.slot_mut(ev);
        let sched = slot.scheduler.upgrade();
        let cb = slot.cb.take();
        let fiber = slot.fiber.take();
        slot.scheduler = Weak::new();

        match sched {
            Some(s) => {
                if let Some(cb) = cb {
                    s.schedule(cb, None);
                } else if let Some(f) = fiber {
                    s.schedule_fiber(f, None);
                } else {
                    swarn!("io: triggered slot had no target");
                }
            }
            None => swarn!("io: event target scheduler is gone, waiter dropped"),
        }
    }
}

/// Per-fd registration state; the mutex serializes both directions.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Self {
        FdContext {
            fd,
            state: Mutex::new(FdState {
                events: EventSet::NONE,
                read: EventSlot::new(),
                write: EventSlot::new(),
            }),
        }
    }
}

/// Scheduler + epoll poller + timer set.
///
/// Derefs to [`Scheduler`], so `schedule`, `thread_ids` and friends are
/// available directly. Construction starts the worker pool; call
/// [`IoManager::stop`] for a clean shutdown before dropping the last
/// handle (idle fibers blocked in the poller hold a reference, so drop
/// alone cannot wind the pool down).
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-pipe: [0] read end (registered edge-triggered), [1] write end.
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RtResult<Arc<IoManager>> {
        Self::with_options(threads, use_caller, name, SchedulerOptions::default())
    }

    pub fn with_options(
        threads: usize,
        use_caller: bool,
        name: &str,
        opts: SchedulerOptions,
    ) -> RtResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::PollerCreate(last_errno()));
        }

        let mut pipe_fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
            let err = RtError::PipeCreate(last_errno());
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let close_all = |err: RtError| {
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            Err(err)
        };

        // Both ends non-blocking: the read end for the drain loop, the
        // write end so a wake can never park the waker behind a full pipe.
        for fd in pipe_fds {
            if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } != 0 {
                return close_all(RtError::Nonblock(last_errno()));
            }
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) } != 0 {
            return close_all(RtError::PollerCtl(last_errno()));
        }

        let sched = Scheduler::with_options(threads, use_caller, name, opts);
        let io = Arc::new(IoManager {
            sched: sched.clone(),
            timers: TimerManager::new(),
            epfd,
            tickle_fds: pipe_fds,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
        });

        io.grow_contexts(32);
        let hooks: Weak<dyn SchedulerHooks> = Arc::downgrade(&(io.clone() as Arc<dyn SchedulerHooks>));
        sched.install_hooks(hooks);
        let front_weak = Arc::downgrade(&io);
        io.timers.set_on_front(Box::new(move || {
            if let Some(io) = front_weak.upgrade() {
                io.tickle_io();
            }
        }));

        sched.start();
        sdebug!("io {}: started (epfd {})", sched.name(), epfd);
        Ok(io)
    }

    /// The IO manager the calling thread works for, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|s| s.hooks_io())
    }

    /// Register interest in one direction of `fd`.
    ///
    /// `ev` must be exactly [`EventSet::READ`] or [`EventSet::WRITE`];
    /// anything else fails with [`RtError::InvalidEvent`]. With a callback,
    /// the callback is scheduled when the direction fires; without one, the
    /// *calling fiber* is captured and resumed instead (register, then
    /// yield). A direction holds at most one waiter: registering twice
    /// fails with [`RtError::EventExists`] and changes nothing.
    pub fn add_event(&self, fd: RawFd, ev: EventSet, cb: Option<FiberFn>) -> RtResult<()> {
        if ev != EventSet::READ && ev != EventSet::WRITE {
            swarn!(
                "io {}: add_event on fd {} wants one direction, got {:?}",
                self.sched.name(),
                fd,
                ev
            );
            return Err(RtError::InvalidEvent);
        }
        let ctx = self.fd_context(fd);
        let mut st = ctx.state.lock().unwrap();
        if st.events.contains(ev) {
            swarn!(
                "io {}: fd {} {:?} already has a waiter",
                self.sched.name(),
                fd,
                ev
            );
            return Err(RtError::EventExists);
        }

        let combined = st.events | ev;
        let op = if st.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_update(op, fd, combined)?;

        self.pending.fetch_add(1, Ordering::SeqCst);
        st.events = combined;

        let slot = st.slot_mut(ev);
        slot.scheduler = match Scheduler::current() {
            Some(s) => Arc::downgrade(&s),
            None => Arc::downgrade(&self.sched),
        };
        match cb {
            Some(cb) => slot.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                debug_assert_eq!(
                    cur.state(),
                    FiberState::Running,
                    "captured fiber must be the one running"
                );
                slot.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Drop a registration without delivering it. Returns whether one
    /// existed.
    pub fn del_event(&self, fd: RawFd, ev: EventSet) -> bool {
        if ev != EventSet::READ && ev != EventSet::WRITE {
            return false;
        }
        let Some(ctx) = self.try_fd_context(fd) else {
            return false;
        };
        let mut st = ctx.state.lock().unwrap();
        if !st.events.contains(ev) {
            return false;
        }

        let left = st.events - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        st.events = left;
        st.slot_mut(ev).clear();
        true
    }

    /// Cancel a registration, delivering its waiter exactly once as if the
    /// event had fired. Returns whether one existed.
    pub fn cancel_event(&self, fd: RawFd, ev: EventSet) -> bool {
        if ev != EventSet::READ && ev != EventSet::WRITE {
            return false;
        }
        let Some(ctx) = self.try_fd_context(fd) else {
            return false;
        };
        let mut st = ctx.state.lock().unwrap();
        if !st.events.contains(ev) {
            return false;
        }

        let left = st.events - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_update(op, fd, left).is_err() {
            return false;
        }
        st.trigger(ev);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Cancel every registration on `fd`, delivering each waiter once.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.try_fd_context(fd) else {
            return false;
        };
        let mut st = ctx.state.lock().unwrap();
        if st.events.is_empty() {
            return false;
        }

        if self.epoll_update(libc::EPOLL_CTL_DEL, fd, EventSet::NONE).is_err() {
            return false;
        }
        if st.events.contains(EventSet::READ) {
            st.trigger(EventSet::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if st.events.contains(EventSet::WRITE) {
            st.trigger(EventSet::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(st.events.is_empty());
        true
    }

    /// Add a one-shot or recurring timer (see [`TimerManager::add_timer`]).
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Option<Arc<Timer>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Add a timer suppressed once `cond` is dropped.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Option<Arc<Timer>>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, cb, cond, recurring)
    }

    /// Stop the pool: request shutdown, wake every poller, drain and join.
    ///
    /// Waits for pending event registrations and timers to drain; cancel
    /// them first if they should not hold shutdown up.
    pub fn stop(&self) {
        self.sched.set_stopping();
        for _ in 0..self.sched.worker_count() {
            self.wake_poller();
        }
        self.sched.stop();
    }

    fn grow_contexts(&self, len: usize) {
        let mut v = self.contexts.write().unwrap();
        while v.len() < len {
            let next = v.len() as RawFd;
            v.push(Arc::new(FdContext::new(next)));
        }
    }

    /// Context for `fd`, growing the vector by 1.5x when it is short.
    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let v = self.contexts.read().unwrap();
            if (fd as usize) < v.len() {
                return v[fd as usize].clone();
            }
        }
        let target = ((fd as usize) + 1).max((fd as usize) * 3 / 2);
        self.grow_contexts(target);
        self.contexts.read().unwrap()[fd as usize].clone()
    }

    fn try_fd_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn epoll_update(&self, op: libc::c_int, fd: RawFd, events: EventSet) -> RtResult<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let errno = last_errno();
            serror!(
                "io {}: epoll_ctl(op={}, fd={}) failed: errno {}",
                self.sched.name(),
                op,
                fd,
                errno
            );
            return Err(RtError::PollerCtl(errno));
        }
        Ok(())
    }

    /// Write one byte into the self-pipe, ending an in-flight poll.
    fn wake_poller(&self) {
        let byte = [1u8];
        let rc = unsafe {
            libc::write(
                self.tickle_fds[1],
                byte.as_ptr() as *const libc::c_void,
                1,
            )
        };
        if rc != 1 {
            swarn!("io {}: tickle write returned {}", self.sched.name(), rc);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn tickle_io(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        self.wake_poller();
    }

    fn stopping_io(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
            && !self.timers.has_timer()
            && self.sched.base_stopping()
    }

    /// The idle fiber body: block in the poller, dispatch readiness and
    /// expired timers, yield so queued work can run.
    fn idle_loop(&self) {
        let tid = OsThread::current_tid();
        sdebug!("io {}: idle fiber on thread {}", self.sched.name(), tid);
        let batch = self.sched.options().poll_batch;
        let poll_cap = self.sched.options().poll_cap_ms;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; batch];

        loop {
            if self.stopping_io() {
                sdebug!("io {}: idle exits on thread {}", self.sched.name(), tid);
                break;
            }

            let next = self.timers.next_timeout();
            let timeout_ms = if next == NO_TIMEOUT {
                poll_cap
            } else {
                next.min(poll_cap)
            } as libc::c_int;

            let n = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), batch as libc::c_int, timeout_ms)
            };
            if n < 0 {
                let errno = last_errno();
                if errno != libc::EINTR {
                    serror!("io {}: epoll_wait failed: errno {}", self.sched.name(), errno);
                }
                continue;
            }

            for e in &events[..n as usize] {
                let fd = e.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle_pipe();
                    continue;
                }

                let Some(ctx) = self.try_fd_context(fd) else {
                    continue;
                };
                let mut st = ctx.state.lock().unwrap();

                let bits = e.events;
                let mut fired = EventSet::NONE;
                if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // Errors and hangups surface on every waiting direction.
                    fired |= (EventSet::READ | EventSet::WRITE) & st.events;
                }
                if bits & libc::EPOLLIN as u32 != 0 {
                    fired |= EventSet::READ;
                }
                if bits & libc::EPOLLOUT as u32 != 0 {
                    fired |= EventSet::WRITE;
                }
                fired &= st.events;
                if fired.is_empty() {
                    continue;
                }

                let left = st.events - fired;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(op, ctx.fd, left).is_err() {
                    continue;
                }

                if fired.contains(EventSet::READ) {
                    st.trigger(EventSet::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if fired.contains(EventSet::WRITE) {
                    st.trigger(EventSet::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            let mut expired: Vec<TimerCallback> = Vec::new();
            self.timers.list_expired(&mut expired);
            for cb in expired {
                self.sched.schedule(move || cb(), None);
            }

            Fiber::yield_now();
        }
    }
}

impl SchedulerHooks for IoManager {
    fn tickle(&self) {
        self.tickle_io();
    }

    fn idle(&self) {
        self.idle_loop();
    }

    fn stopping(&self) -> bool {
        self.stopping_io()
    }

    fn as_io(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Usually a no-op: stop() has already run, because idle fibers
        // blocked in the poller keep this object alive until then.
        self.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}
