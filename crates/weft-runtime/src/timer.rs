//! Deadline-ordered timers
//!
//! A time-ordered set of callbacks supporting one-shot, recurring and
//! condition-gated timers. The set reports the delay to the next due
//! timer so an I/O wait can bound its sleep, and wakes the waiter (via a
//! configurable hook) when a new earliest deadline is inserted.
//!
//! Deadlines are wall-clock milliseconds; a clock jumping more than the
//! rollback guard backwards triggers a single full drain so timers cannot
//! be stranded an hour in the future.

use weft_core::constants::{CLOCK_ROLLBACK_GUARD_MS, NO_TIMEOUT};

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared timer callback (recurring timers fire it repeatedly)
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Wake hook invoked when a new earliest deadline appears
pub type WakeFn = Box<dyn Fn() + Send + Sync>;

/// Current wall time in milliseconds since the UNIX epoch
///
/// A clock set before the epoch reads as 0, which the rollback guard
/// treats like any other backwards jump.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// True when `now` is more than the guard interval before `prev`
#[inline]
fn clock_rolled_back(prev_ms: u64, now_ms: u64) -> bool {
    now_ms + CLOCK_ROLLBACK_GUARD_MS < prev_ms
}

struct TimerData {
    period_ms: u64,
    deadline_ms: u64,
    cb: Option<TimerCallback>,
    recurring: bool,
}

/// Handle to a scheduled timer
///
/// Holds a weak pointer to the owning store; once the manager is gone all
/// handle operations fail quietly.
pub struct Timer {
    seq: u64,
    data: Mutex<TimerData>,
    store: Weak<TimerStore>,
    self_weak: Weak<Timer>,
}

/// Ordering key: strict deadline order, identity (sequence) tie-break
type TimerKey = (u64, u64);

struct TimerStore {
    set: RwLock<BTreeMap<TimerKey, Arc<Timer>>>,
    /// One "earliest changed" notification per observation cycle
    tickled: AtomicBool,
    /// Wall time observed by the last drain (rollback detection)
    prev_ms: Mutex<u64>,
    wake: Mutex<Option<WakeFn>>,
    next_seq: AtomicU64,
}

/// Owner of the ordered timer set
pub struct TimerManager {
    store: Arc<TimerStore>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            store: Arc::new(TimerStore {
                set: RwLock::new(BTreeMap::new()),
                tickled: AtomicBool::new(false),
                prev_ms: Mutex::new(now_ms()),
                wake: Mutex::new(None),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Install the hook invoked when an insert produces a new earliest
    /// deadline (the I/O manager wires this to its tickle pipe).
    pub fn set_wake(&self, wake: WakeFn) {
        *self.store.wake.lock().unwrap() = Some(wake);
    }

    /// Schedule `cb` to run after `ms` milliseconds
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        let timer = Arc::new_cyclic(|weak| Timer {
            seq: self.store.next_seq.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(TimerData {
                period_ms: ms,
                deadline_ms: now_ms() + ms,
                cb: Some(cb),
                recurring,
            }),
            store: Arc::downgrade(&self.store),
            self_weak: weak.clone(),
        });
        insert(&self.store, timer.clone());
        timer
    }

    /// Schedule `cb`, gated on `cond` still being resolvable at fire time
    pub fn add_condition_timer(
        &self,
        ms: u64,
        cb: TimerCallback,
        cond: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer> {
        let gated: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, gated, recurring)
    }

    /// Milliseconds until the earliest timer is due
    ///
    /// Returns 0 if one is already due, `u64::MAX` if the set is empty.
    /// Clears the tickled flag so the next earliest-insert re-wakes the
    /// waiter.
    pub fn next_delay_ms(&self) -> u64 {
        self.store.tickled.store(false, Ordering::SeqCst);
        let set = self.store.set.read().unwrap();
        let Some(&(deadline, _)) = set.keys().next() else {
            return NO_TIMEOUT;
        };
        let now = now_ms();
        if deadline <= now {
            0
        } else {
            deadline - now
        }
    }

    /// Pop every timer whose deadline has passed (or all of them after a
    /// clock rollback) and return their callbacks in deadline order.
    /// Recurring timers are reinserted with deadline = now + period.
    pub fn drain_expired(&self) -> Vec<TimerCallback> {
        let now = now_ms();
        let mut cbs = Vec::new();
        let mut set = self.store.set.write().unwrap();

        let rollover = {
            let mut prev = self.store.prev_ms.lock().unwrap();
            let r = clock_rolled_back(*prev, now);
            *prev = now;
            r
        };

        loop {
            let Some(&key) = set.keys().next() else { break };
            if !rollover && key.0 > now {
                break;
            }
            let timer = set.remove(&key).unwrap();

            let reinsert_key = {
                let mut d = timer.data.lock().unwrap();
                if d.recurring {
                    if let Some(cb) = &d.cb {
                        cbs.push(cb.clone());
                    }
                    d.deadline_ms = now + d.period_ms;
                    Some((d.deadline_ms, timer.seq))
                } else {
                    if let Some(cb) = d.cb.take() {
                        cbs.push(cb);
                    }
                    None
                }
            };
            if let Some(key) = reinsert_key {
                set.insert(key, timer);
            }
        }
        cbs
    }

    /// True if any timer is scheduled
    pub fn has_timer(&self) -> bool {
        !self.store.set.read().unwrap().is_empty()
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert into the ordered set; when this produces a new earliest
/// deadline and no wake has been emitted since the last observation,
/// fire the wake hook once.
fn insert(store: &Arc<TimerStore>, timer: Arc<Timer>) {
    let at_front = {
        let mut set = store.set.write().unwrap();
        let key = {
            let d = timer.data.lock().unwrap();
            (d.deadline_ms, timer.seq)
        };
        set.insert(key, timer);
        let is_front = set.keys().next() == Some(&key);
        is_front && !store.tickled.swap(true, Ordering::SeqCst)
    };
    if at_front {
        if let Some(wake) = &*store.wake.lock().unwrap() {
            wake();
        }
    }
}

impl Timer {
    /// Cancel the timer: clear the callback and remove it from the set.
    /// Idempotent after the first success.
    pub fn cancel(&self) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let mut set = store.set.write().unwrap();
        let mut d = self.data.lock().unwrap();
        if d.cb.is_none() {
            return false;
        }
        d.cb = None;
        set.remove(&(d.deadline_ms, self.seq));
        true
    }

    /// Push the deadline out to now + period
    ///
    /// Fails once the callback has been consumed or the timer is no
    /// longer in the set.
    pub fn refresh(&self) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let this = self.self_weak.upgrade().expect("timer without a live handle");
        let mut set = store.set.write().unwrap();
        let mut d = self.data.lock().unwrap();
        if d.cb.is_none() {
            return false;
        }
        if set.remove(&(d.deadline_ms, self.seq)).is_none() {
            return false;
        }
        d.deadline_ms = now_ms() + d.period_ms;
        set.insert((d.deadline_ms, self.seq), this);
        true
    }

    /// Change the period and rebase the deadline on `now` (`from_now`) or
    /// on the previous deadline's start.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        {
            let d = self.data.lock().unwrap();
            if ms == d.period_ms && !from_now {
                return true;
            }
        }
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let this = self.self_weak.upgrade().expect("timer without a live handle");
        {
            let mut set = store.set.write().unwrap();
            let mut d = self.data.lock().unwrap();
            if d.cb.is_none() {
                return false;
            }
            if set.remove(&(d.deadline_ms, self.seq)).is_none() {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                d.deadline_ms - d.period_ms
            };
            d.period_ms = ms;
            d.deadline_ms = start + ms;
        }
        // reinsert outside the timer lock so the at-front wake can fire
        insert(&store, this);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;
    use std::time::Duration;

    fn counter_cb(hits: &Arc<AtomicUsize>) -> TimerCallback {
        let hits = hits.clone();
        Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_next_delay_empty() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_delay_ms(), u64::MAX);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_expired_fires_once() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(10, counter_cb(&hits), false);

        sleep(Duration::from_millis(30));
        assert_eq!(mgr.next_delay_ms(), 0);
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
        assert!(mgr.drain_expired().is_empty());
    }

    #[test]
    fn test_cancel_before_fire() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(10, counter_cb(&hits), false);

        assert!(t.cancel());
        assert!(!t.cancel()); // idempotent after first success
        sleep(Duration::from_millis(30));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(10, counter_cb(&hits), true);

        sleep(Duration::from_millis(30));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer());

        sleep(Duration::from_millis(30));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        t.cancel();
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_skips_dead_cond() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let cond: Arc<dyn Any + Send + Sync> = Arc::new(0u32);
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&cond);
        mgr.add_condition_timer(10, counter_cb(&hits), weak, false);
        drop(cond);

        sleep(Duration::from_millis(30));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ordering_by_deadline() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for ms in [30u64, 10, 20] {
            let order = order.clone();
            mgr.add_timer(
                ms,
                Arc::new(move || {
                    order.lock().unwrap().push(ms);
                }),
                false,
            );
        }
        sleep(Duration::from_millis(60));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn test_wake_fires_once_per_observation() {
        let mgr = TimerManager::new();
        let wakes = Arc::new(AtomicUsize::new(0));
        let w = wakes.clone();
        mgr.set_wake(Box::new(move || {
            w.fetch_add(1, Ordering::SeqCst);
        }));

        mgr.add_timer(1000, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // earlier deadline, but no observation since the last wake
        mgr.add_timer(500, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        // observation clears the flag; the next earliest-insert wakes again
        let _ = mgr.next_delay_ms();
        mgr.add_timer(100, Arc::new(|| {}), false);
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_refresh_and_reset() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(20, counter_cb(&hits), false);

        assert!(t.refresh());
        assert!(t.reset(50, true));

        sleep(Duration::from_millis(20));
        assert!(mgr.drain_expired().is_empty());

        sleep(Duration::from_millis(50));
        for cb in mgr.drain_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // consumed: handle operations now fail
        assert!(!t.refresh());
        assert!(!t.reset(10, true));
    }

    #[test]
    fn test_rollback_drains_everything_once() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(60_000, counter_cb(&hits), false);
        mgr.add_timer(120_000, counter_cb(&hits), false);

        // pretend the last drain observed a wall clock far in the future
        *mgr.store.prev_ms.lock().unwrap() = now_ms() + 2 * CLOCK_ROLLBACK_GUARD_MS;

        let cbs = mgr.drain_expired();
        assert_eq!(cbs.len(), 2);
        for cb in cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!mgr.has_timer());

        // the defensive drain happens exactly once
        mgr.add_timer(60_000, counter_cb(&hits), false);
        assert!(mgr.drain_expired().is_empty());
    }

    #[test]
    fn test_clock_rollback_predicate() {
        assert!(!clock_rolled_back(1_000, 1_000));
        assert!(!clock_rolled_back(1_000, 500));
        let hour = CLOCK_ROLLBACK_GUARD_MS;
        assert!(!clock_rolled_back(hour + 1_000, 1_000));
        assert!(clock_rolled_back(hour + 1_001, 1_000));
    }
}
