//! Deadline set
//!
//! Timers live in an ordered set keyed by (absolute deadline, identity);
//! the head of the set tells the poller how long it may sleep. Inserting a
//! new head has to cut that sleep short, so the manager carries a notifier
//! callback, wired by the I/O manager to its wake pipe.
//!
//! A timer's deadline is only ever rewritten while the timer is out of the
//! set, which keeps the ordering key stable as far as the set can observe.
//!
//! Deadlines come from the raw monotonic clock. Should that clock ever
//! jump backwards by more than an hour, every armed timer is expired once
//! rather than risking a permanent stall.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use weft_core::time::elapsed_ms;

/// Rollover threshold: treat a backwards jump beyond this as a clock reset
const ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Shared, repeatedly-invocable timer callback
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Wake-the-poller hook, invoked when an insert becomes the new head
pub type FrontNotifier = Box<dyn Fn() + Send + Sync>;

/// A scheduled deadline
pub struct Timer {
    /// Absolute expiry in monotonic milliseconds; rewritten only while the
    /// timer is not a member of the set
    next: AtomicU64,
    /// Recurrence interval (also the initial delay)
    period_ms: AtomicU64,
    recurring: bool,
    callback: Mutex<Option<TimerCallback>>,
    owner: Weak<TimerShared>,
}

impl Timer {
    #[inline]
    pub fn deadline_ms(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_recurring(&self) -> bool {
        self.recurring
    }

    /// Disarm the timer: null the callback and drop set membership.
    /// Returns false if the timer had already fired or been cancelled.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        let mut set = owner.timers.write().unwrap();
        let had_cb = self.callback.lock().unwrap().take().is_some();
        if had_cb {
            set.remove(&TimerKey(self.clone()));
            return true;
        }
        false
    }

    /// Push the deadline a full period out from now
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        let mut set = owner.timers.write().unwrap();
        if self.callback.lock().unwrap().is_none() {
            return false;
        }
        if !set.remove(&TimerKey(self.clone())) {
            return false;
        }
        self.next.store(
            elapsed_ms() + self.period_ms.load(Ordering::Acquire),
            Ordering::Release,
        );
        set.insert(TimerKey(self.clone()));
        true
    }

    /// Change the period; rebase from now or from the original start
    pub fn reset(self: &Arc<Self>, period_ms: u64, from_now: bool) -> bool {
        if period_ms == self.period_ms.load(Ordering::Acquire) && !from_now {
            return true;
        }
        let Some(owner) = self.owner.upgrade() else {
            return false;
        };
        let at_front;
        {
            let mut set = owner.timers.write().unwrap();
            if self.callback.lock().unwrap().is_none() {
                return false;
            }
            if !set.remove(&TimerKey(self.clone())) {
                return false;
            }
            let start = if from_now {
                elapsed_ms()
            } else {
                self.next.load(Ordering::Acquire) - self.period_ms.load(Ordering::Acquire)
            };
            self.period_ms.store(period_ms, Ordering::Release);
            self.next.store(start + period_ms, Ordering::Release);
            at_front = owner.insert_locked(&mut set, self.clone());
        }
        if at_front {
            owner.notify_front();
        }
        true
    }
}

/// Set key: deadline first, identity as the tiebreak for a stable order
struct TimerKey(Arc<Timer>);

impl TimerKey {
    #[inline]
    fn sort_key(&self) -> (u64, usize) {
        (
            self.0.next.load(Ordering::Acquire),
            Arc::as_ptr(&self.0) as usize,
        )
    }
}

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TimerKey {}

impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

struct TimerShared {
    timers: RwLock<BTreeSet<TimerKey>>,
    /// Set once a front-insert notification has been sent and not yet
    /// consumed by `next_timer_ms`, so the poller is not woken repeatedly
    tickled: AtomicBool,
    /// Previous clock sample, for rollover detection
    previous_ms: AtomicU64,
    notifier: Option<FrontNotifier>,
}

impl TimerShared {
    /// Insert under the write lock; true if this became the head and the
    /// poller has not been nudged yet
    fn insert_locked(&self, set: &mut BTreeSet<TimerKey>, timer: Arc<Timer>) -> bool {
        set.insert(TimerKey(timer.clone()));
        let at_front = set
            .first()
            .is_some_and(|head| Arc::ptr_eq(&head.0, &timer));
        at_front && !self.tickled.swap(true, Ordering::AcqRel)
    }

    fn notify_front(&self) {
        if let Some(n) = &self.notifier {
            n();
        }
    }
}

/// Ordered deadline set with expiry draining
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    /// A manager with no poller to wake (standalone use, tests)
    pub fn new() -> TimerManager {
        Self::build(None)
    }

    /// A manager that calls `notifier` whenever the next deadline moves
    /// earlier than the one the poller went to sleep on
    pub fn with_notifier(notifier: FrontNotifier) -> TimerManager {
        Self::build(Some(notifier))
    }

    fn build(notifier: Option<FrontNotifier>) -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                timers: RwLock::new(BTreeSet::new()),
                tickled: AtomicBool::new(false),
                previous_ms: AtomicU64::new(elapsed_ms()),
                notifier,
            }),
        }
    }

    /// Arm a timer `delay_ms` from now
    pub fn add_timer<F>(&self, delay_ms: u64, callback: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_arc(delay_ms, Arc::new(callback), recurring)
    }

    pub(crate) fn add_timer_arc(
        &self,
        delay_ms: u64,
        callback: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = Arc::new(Timer {
            next: AtomicU64::new(elapsed_ms() + delay_ms),
            period_ms: AtomicU64::new(delay_ms),
            recurring,
            callback: Mutex::new(Some(callback)),
            owner: Arc::downgrade(&self.shared),
        });
        let at_front = {
            let mut set = self.shared.timers.write().unwrap();
            self.shared.insert_locked(&mut set, timer.clone())
        };
        if at_front {
            self.shared.notify_front();
        }
        timer
    }

    /// Arm a timer that only fires while `condition` still has a live
    /// referent; a dropped condition turns the expiry into a no-op
    pub fn add_condition_timer<F>(
        &self,
        delay_ms: u64,
        callback: F,
        condition: Weak<dyn Any + Send + Sync>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(
            delay_ms,
            move || {
                if condition.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.timers.read().unwrap().is_empty()
    }

    /// Milliseconds until the next deadline: `u64::MAX` when no timer is
    /// armed, 0 when the head is already due. Re-arms front notification.
    pub fn next_timer_ms(&self) -> u64 {
        let set = self.shared.timers.read().unwrap();
        self.shared.tickled.store(false, Ordering::Release);
        let Some(head) = set.first() else {
            return u64::MAX;
        };
        let now = elapsed_ms();
        let next = head.0.next.load(Ordering::Acquire);
        if now >= next {
            0
        } else {
            next - now
        }
    }

    /// Drain every callback whose deadline has passed, re-arming recurring
    /// timers at `now + period`
    pub fn expired_callbacks(&self, out: &mut Vec<TimerCallback>) {
        let now = elapsed_ms();
        if self.shared.timers.read().unwrap().is_empty() {
            return;
        }

        let mut set = self.shared.timers.write().unwrap();
        let rollover = self.detect_rollover(now);
        if !rollover {
            match set.first() {
                Some(head) if head.0.next.load(Ordering::Acquire) > now => return,
                None => return,
                _ => {}
            }
        }

        let mut expired = Vec::new();
        while let Some(head) = set.first() {
            if !rollover && head.0.next.load(Ordering::Acquire) > now {
                break;
            }
            expired.push(set.pop_first().unwrap().0);
        }

        out.reserve(expired.len());
        for timer in expired {
            let cb = if timer.recurring {
                let cb = timer.callback.lock().unwrap().clone();
                timer.next.store(
                    now + timer.period_ms.load(Ordering::Acquire),
                    Ordering::Release,
                );
                set.insert(TimerKey(timer.clone()));
                cb
            } else {
                timer.callback.lock().unwrap().take()
            };
            if let Some(cb) = cb {
                out.push(cb);
            }
        }
    }

    /// A backwards jump of more than an hour means the monotonic source
    /// reset; report it so the caller expires everything once.
    fn detect_rollover(&self, now: u64) -> bool {
        let previous = self.shared.previous_ms.swap(now, Ordering::AcqRel);
        now < previous && previous - now > ROLLOVER_MS
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drain(mgr: &TimerManager) -> usize {
        let mut cbs = Vec::new();
        mgr.expired_callbacks(&mut cbs);
        let n = cbs.len();
        for cb in cbs {
            cb();
        }
        n
    }

    #[test]
    fn test_next_timer_ms_empty() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), u64::MAX);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_expiry_order_and_drain() {
        let mgr = TimerManager::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for (tag, delay) in [("b", 20u64), ("a", 1), ("c", 40)] {
            let f = fired.clone();
            mgr.add_timer(delay, move || f.lock().unwrap().push(tag), false);
        }
        assert!(mgr.has_timer());
        assert!(mgr.next_timer_ms() <= 1);

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert_eq!(drain(&mgr), 3);
        assert_eq!(*fired.lock().unwrap(), ["a", "b", "c"]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_recurring_rearms() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        mgr.add_timer(
            5,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        std::thread::sleep(std::time::Duration::from_millis(10));
        drain(&mgr);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer(), "recurring timer must stay armed");

        std::thread::sleep(std::time::Duration::from_millis(10));
        drain(&mgr);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_then_cancel_is_noop() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timer());
        assert_eq!(mgr.next_timer_ms(), u64::MAX);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = mgr.add_timer(
            1,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        timer.cancel();
        std::thread::sleep(std::time::Duration::from_millis(5));
        drain(&mgr);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_delays_expiry() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let timer = mgr.add_timer(
            30,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(timer.refresh());

        // The original deadline has passed but refresh pushed it out.
        std::thread::sleep(std::time::Duration::from_millis(20));
        drain(&mgr);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        std::thread::sleep(std::time::Duration::from_millis(15));
        drain(&mgr);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reset_from_now() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(500, || {}, false);
        let before = timer.deadline_ms();
        assert!(timer.reset(50, true));
        assert!(timer.deadline_ms() < before);
        assert!(mgr.next_timer_ms() <= 50);
    }

    #[test]
    fn test_condition_timer_skips_dead_condition() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));

        let live: Arc<dyn Any + Send + Sync> = Arc::new(());
        let c = count.clone();
        mgr.add_condition_timer(
            1,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&live),
            false,
        );

        let dead: Arc<dyn Any + Send + Sync> = Arc::new(());
        let weak_dead = Arc::downgrade(&dead);
        drop(dead);
        let c = count.clone();
        mgr.add_condition_timer(
            1,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            weak_dead,
            false,
        );

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(drain(&mgr), 2, "both callbacks drain");
        assert_eq!(count.load(Ordering::SeqCst), 1, "only the live one fires");
    }

    #[test]
    fn test_front_notifier_fires_on_new_head() {
        let notified = Arc::new(AtomicUsize::new(0));
        let n = notified.clone();
        let mgr = TimerManager::with_notifier(Box::new(move || {
            n.fetch_add(1, Ordering::SeqCst);
        }));

        mgr.add_timer(1000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Not a new head: no notification.
        mgr.add_timer(2000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // New head, but the previous nudge has not been consumed yet.
        mgr.add_timer(10, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // After the poller re-reads the deadline, a new head notifies again.
        let _ = mgr.next_timer_ms();
        mgr.add_timer(1, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
