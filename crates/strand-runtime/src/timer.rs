//! Absolute-deadline timers
//!
//! An ordered set of timers keyed by `(deadline, id)` so equal deadlines
//! fire in insertion order. Deadlines are wall-clock milliseconds since the
//! UNIX epoch; a backwards jump of more than one hour is treated as an
//! expiry storm so no timer starves silently.
//!
//! The manager itself never sleeps or polls. Whoever drives it (the IO
//! manager's idle loop) asks for `next_timeout`, waits at most that long,
//! then drains `list_expired`. Inserting a timer at the front of the set
//! fires the `on_front` hook so the driver can shorten an in-flight wait.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use strand_core::swarn;

/// Timer callbacks may fire more than once (recurring), so they are shared.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Sentinel returned by [`TimerManager::next_timeout`] when no timer is set.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Wall clock, milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One hour, the rewind threshold.
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to a pending timer.
///
/// Shared between the caller (who may cancel, refresh or reset it) and the
/// manager's ordered set. A cancelled timer has an empty callback slot and
/// is no longer in the set.
pub struct Timer {
    id: u64,
    period_ms: AtomicU64,
    deadline_ms: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<TimerCallback>>,
    mgr: Weak<TimerManager>,
}

impl Timer {
    fn key(&self) -> (u64, u64) {
        (self.deadline_ms.load(Ordering::Acquire), self.id)
    }

    /// Remove the timer from its manager and drop the callback.
    ///
    /// Returns false when the timer was already cancelled or has fired.
    pub fn cancel(&self) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut timers = mgr.timers.write().unwrap();
        let mut cb = self.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&self.key());
        true
    }

    /// Push the deadline out to now + period.
    ///
    /// Returns false when the timer is cancelled or no longer pending.
    pub fn refresh(&self) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut timers = mgr.timers.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        let Some(t) = timers.remove(&self.key()) else {
            return false;
        };
        let deadline = now_ms() + self.period_ms.load(Ordering::Acquire);
        self.deadline_ms.store(deadline, Ordering::Release);
        timers.insert((deadline, self.id), t);
        true
    }

    /// Change the period to `ms`.
    ///
    /// The new deadline counts from now when `from_now`, otherwise from the
    /// timer's original start (old deadline minus old period). Reinsertion
    /// goes through the front-detection path, so shortening the head timer
    /// wakes the driver.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.period_ms.load(Ordering::Acquire) && !from_now {
            return true;
        }
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let taken = {
            let mut timers = mgr.timers.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            match timers.remove(&self.key()) {
                Some(t) => t,
                None => return false,
            }
        };

        let old_deadline = self.deadline_ms.load(Ordering::Acquire);
        let old_period = self.period_ms.load(Ordering::Acquire);
        let start = if from_now {
            now_ms()
        } else {
            old_deadline.saturating_sub(old_period)
        };
        self.period_ms.store(ms, Ordering::Release);
        self.deadline_ms.store(start + ms, Ordering::Release);
        mgr.insert(taken);
        true
    }
}

/// Ordered set of live timers.
pub struct TimerManager {
    timers: RwLock<BTreeMap<(u64, u64), Arc<Timer>>>,
    /// Suppresses duplicate front-insert wakeups until the driver next
    /// recomputes its timeout.
    tickled: AtomicBool,
    /// Last observed wall time, for rewind detection.
    last_time: Mutex<u64>,
    /// Fired when an insert becomes the new head (under the tickled gate).
    on_front: OnceLock<Box<dyn Fn() + Send + Sync>>,
    self_weak: Weak<TimerManager>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new_cyclic(|w| TimerManager {
            timers: RwLock::new(BTreeMap::new()),
            tickled: AtomicBool::new(false),
            last_time: Mutex::new(now_ms()),
            on_front: OnceLock::new(),
            self_weak: w.clone(),
        })
    }

    pub(crate) fn set_on_front(&self, hook: Box<dyn Fn() + Send + Sync>) {
        let _ = self.on_front.set(hook);
    }

    /// Add a timer firing in `ms` milliseconds. Returns None when `ms` is
    /// zero. Recurring timers re-arm themselves on expiry.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Option<Arc<Timer>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_shared(ms, Arc::new(cb), recurring)
    }

    pub(crate) fn add_timer_shared(
        &self,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Option<Arc<Timer>> {
        if ms == 0 {
            return None;
        }
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            period_ms: AtomicU64::new(ms),
            deadline_ms: AtomicU64::new(now_ms() + ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            mgr: self.self_weak.clone(),
        });
        self.insert(timer.clone());
        Some(timer)
    }

    /// Add a timer whose callback is skipped once `cond` has been dropped.
    ///
    /// Cheap cancel-on-owner-death: the callback upgrades the weak handle
    /// and silently does nothing when the owner is gone.
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
        let wrapped: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer_shared(ms, wrapped, recurring)
    }

    /// Insert into the set; fire `on_front` when this became the head and
    /// the tickled gate was clear.
    fn insert(&self, timer: Arc<Timer>) {
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            let key = timer.key();
            timers.insert(key, timer);
            *timers.keys().next().unwrap() == key
        };
        if at_front && !self.tickled.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.on_front.get() {
                hook();
            }
        }
    }

    /// Milliseconds until the earliest deadline: 0 when already due,
    /// [`NO_TIMEOUT`] when the set is empty. Clears the tickled gate.
    pub fn next_timeout(&self) -> u64 {
        self.tickled.store(false, Ordering::SeqCst);
        let timers = self.timers.read().unwrap();
        match timers.keys().next() {
            None => NO_TIMEOUT,
            Some(&(deadline, _)) => {
                let now = now_ms();
                if deadline <= now {
                    0
                } else {
                    deadline - now
                }
            }
        }
    }

    /// True when at least one timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Drain every due timer's callback into `out`.
    ///
    /// A rewind beyond one hour expires the whole set. Recurring timers are
    /// re-keyed to now + period; one-shot timers give up their callback.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut timers = self.timers.write().unwrap();
        let rollover = self.detect_clock_rollover(now);
        if rollover && !timers.is_empty() {
            swarn!("timer set: clock rewind detected, expiring all {} timers", timers.len());
        }

        // Snapshot the due set in one pass before reinserting anything:
        // during a rewind storm every deadline counts as due, and a
        // recurring timer put back while still scanning would be due again.
        let due: Vec<Arc<Timer>> = if rollover {
            std::mem::take(&mut *timers).into_values().collect()
        } else {
            let mut due = Vec::new();
            loop {
                let key = match timers.keys().next() {
                    Some(&key) if key.0 <= now => key,
                    _ => break,
                };
                due.push(timers.remove(&key).unwrap());
            }
            due
        };

        for timer in due {
            let cb = {
                let mut slot = timer.cb.lock().unwrap();
                if timer.recurring {
                    slot.clone()
                } else {
                    slot.take()
                }
            };
            if let Some(cb) = cb {
                out.push(cb);
            }
            if timer.recurring {
                let deadline = now + timer.period_ms.load(Ordering::Acquire);
                timer.deadline_ms.store(deadline, Ordering::Release);
                timers.insert((deadline, timer.id), timer);
            }
        }
    }

    /// Report a rewind when the clock sits more than an hour before the
    /// previous observation; the observation always advances.
    fn detect_clock_rollover(&self, now: u64) -> bool {
        let mut last = self.last_time.lock().unwrap();
        let rolled = now < last.saturating_sub(ROLLOVER_MS);
        *last = now;
        rolled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_zero_ms_rejected() {
        let mgr = TimerManager::new();
        assert!(mgr.add_timer(0, || {}, false).is_none());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timeout_empty_is_sentinel() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout(), NO_TIMEOUT);
    }

    #[test]
    fn test_next_timeout_counts_down() {
        let mgr = TimerManager::new();
        let _t = mgr.add_timer(500, || {}, false).unwrap();
        let remaining = mgr.next_timeout();
        assert!(remaining > 0 && remaining <= 500);
    }

    #[test]
    fn test_expiry_order_matches_deadlines() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(50u64, 50u64), (10, 10), (30, 30)] {
            let order = order.clone();
            mgr.add_timer(ms, move || order.lock().unwrap().push(tag), false)
                .unwrap();
        }

        sleep(Duration::from_millis(80));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(&*order.lock().unwrap(), &[10, 30, 50]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            let order = order.clone();
            mgr.add_timer(20, move || order.lock().unwrap().push(tag), false)
                .unwrap();
        }
        sleep(Duration::from_millis(40));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(&*order.lock().unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn test_cancel_before_fire() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr
            .add_timer(30, move || { h.fetch_add(1, Ordering::SeqCst); }, false)
            .unwrap();

        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(!mgr.has_timer());

        sleep(Duration::from_millis(50));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let t = mgr
            .add_timer(10, move || { h.fetch_add(1, Ordering::SeqCst); }, true)
            .unwrap();

        for _ in 0..2 {
            sleep(Duration::from_millis(20));
            let mut cbs = Vec::new();
            mgr.list_expired(&mut cbs);
            for cb in cbs {
                cb();
            }
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(mgr.has_timer());
        assert!(t.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_skips_dead_owner() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let owner = Arc::new(());
        let h = hits.clone();
        mgr.add_condition_timer(
            10,
            move || { h.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&owner),
            false,
        )
        .unwrap();
        drop(owner);

        sleep(Duration::from_millis(30));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        for cb in cbs {
            cb();
        }
        // The wrapper fired, the user callback did not.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_from_now_extends() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(20, || {}, false).unwrap();
        assert!(t.reset(500, true));

        sleep(Duration::from_millis(40));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert!(mgr.has_timer());
        assert!(t.cancel());
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(50, || {}, false).unwrap();
        sleep(Duration::from_millis(30));
        assert!(t.refresh());
        // Deadline restarted: nothing is due yet.
        sleep(Duration::from_millis(30));
        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert!(cbs.is_empty());
        assert!(t.cancel());
    }

    #[test]
    fn test_rollover_storm_expires_recurring_once() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        // Far from due: only the rewind storm can expire it.
        let t = mgr
            .add_timer(60_000, move || { h.fetch_add(1, Ordering::SeqCst); }, true)
            .unwrap();
        let one_shot = mgr.add_timer(60_000, || {}, false).unwrap();

        // Pretend the last observation was hours ahead of the wall clock.
        *mgr.last_time.lock().unwrap() = now_ms() + 3 * ROLLOVER_MS;

        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        // The storm drains the whole set exactly once and terminates.
        assert_eq!(cbs.len(), 2);
        for cb in cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The recurring timer was re-armed; the one-shot gave up its slot.
        assert!(mgr.has_timer());
        assert!(t.cancel());
        assert!(!one_shot.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_front_insert_fires_hook_once() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        mgr.set_on_front(Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        mgr.add_timer(1000, || {}, false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // New head, but the gate is still set: no second wakeup.
        mgr.add_timer(500, || {}, false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Recomputing the timeout clears the gate.
        let _ = mgr.next_timeout();
        mgr.add_timer(100, || {}, false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
