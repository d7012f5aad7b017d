//! Named OS thread wrapper
//!
//! `OsThread::spawn` does not return until the new thread has published its
//! OS-level thread id, so `tid()` on the handle is always valid. Scheduler
//! callers rely on recording worker tids before dispatching pinned tasks.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use strand_core::Semaphore;

use crate::tls;

/// OS thread id as reported by `gettid`.
pub type Pid = libc::pid_t;

/// A named OS thread with a synchronized start.
pub struct OsThread {
    handle: Option<JoinHandle<()>>,
    tid: Pid,
    name: String,
}

impl OsThread {
    /// Launch a thread running `cb`; blocks until the thread has published
    /// its tid and installed its thread name.
    pub fn spawn<F>(name: &str, cb: F) -> OsThread
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI32::new(-1));

        let sem2 = sem.clone();
        let tid_slot2 = tid_slot.clone();
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tid_slot2.store(OsThread::current_tid(), Ordering::Release);
                tls::set_thread_name(&thread_name);
                sem2.signal();
                cb();
            })
            .expect("failed to spawn OS thread");

        sem.wait();

        OsThread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::Acquire),
            name: name.to_string(),
        }
    }

    /// OS thread id of this thread; valid as soon as `spawn` returns.
    #[inline]
    pub fn tid(&self) -> Pid {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// OS thread id of the calling thread.
    #[inline]
    pub fn current_tid() -> Pid {
        unsafe { libc::syscall(libc::SYS_gettid) as Pid }
    }

    /// Name of the calling thread (thread-local, "UNKNOWN" until set).
    pub fn current_name() -> String {
        tls::thread_name()
    }

    /// Set the calling thread's name.
    pub fn set_current_name(name: &str) {
        tls::set_thread_name(name);
    }
}
