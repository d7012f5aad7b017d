//! Counting semaphore
//!
//! Used by the thread wrapper to make the spawning thread wait until the
//! spawned thread has published its OS thread id.

use std::sync::{Condvar, Mutex};

/// A counting semaphore built on a mutex and condvar.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial count.
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Increment the count and wake one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_before_wait() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.wait(); // does not block
    }

    #[test]
    fn test_cross_thread_handshake() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let t = thread::spawn(move || {
            sem2.signal();
        });
        sem.wait();
        t.join().unwrap();
    }

    #[test]
    fn test_counts_accumulate() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        sem.signal();
        sem.wait();
    }
}
