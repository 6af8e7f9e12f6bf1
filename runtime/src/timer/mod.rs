//! A min-heap of deadlines used to drive fiber-friendly timeouts.
//!
//! Timers are not polled by the caller; the I/O manager's idle loop calls
//! [`TimerManager::next_timeout`] to bound its `epoll_wait` and
//! [`TimerManager::list_expired`] afterward to collect fired callbacks.

mod heap;

use heap::HeapEntry;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("timer {0} was already canceled or has fired")]
    NotActive(u64),
}

/// State shared between a [`TimerHandle`] and the heap entry it's linked to.
///
/// Canceling or refreshing a timer never touches the heap directly (a
/// `BinaryHeap` can't reorder a live entry); instead these flags let a
/// popped entry recognize it's stale, and `refresh`/`reset` push a fresh
/// entry carrying the bumped generation.
pub(crate) struct Shared {
    id: u64,
    callback: Mutex<Box<dyn FnMut() + Send>>,
    deadline: Mutex<Instant>,
    period: Mutex<Duration>,
    canceled: AtomicBool,
    fired: AtomicBool,
    generation: AtomicU64,
}

impl Shared {
    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn invoke(&self) {
        (self.callback.lock().unwrap())();
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to a previously scheduled timer.
///
/// Dropping a `TimerHandle` does not cancel the timer; call
/// [`TimerHandle::cancel`] explicitly if that's desired.
pub struct TimerHandle {
    shared: Arc<Shared>,
    manager: Arc<ManagerInner>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Idempotent. Marks the timer canceled; a pending heap entry for it is
    /// discarded lazily the next time it's popped, not re-heapified now.
    pub fn cancel(&self) {
        self.shared.canceled.store(true, Ordering::Release);
    }

    /// Resets the deadline to `now + period`, keeping the existing period.
    /// A no-op if the timer has already been canceled or has fired.
    pub fn refresh(&self) -> Result<(), Error> {
        if self.shared.is_canceled() || self.shared.is_fired() {
            return Err(Error::NotActive(self.shared.id));
        }
        let period = *self.shared.period.lock().unwrap();
        let new_deadline = Instant::now() + period;
        self.reschedule(new_deadline);
        Ok(())
    }

    /// Changes the timer's period to `new_delay` and its deadline to either
    /// `now + new_delay` (`from_now = true`) or `old_deadline + new_delay`.
    pub fn reset(&self, new_delay: Duration, from_now: bool) -> Result<(), Error> {
        if self.shared.is_canceled() || self.shared.is_fired() {
            return Err(Error::NotActive(self.shared.id));
        }
        *self.shared.period.lock().unwrap() = new_delay;
        let new_deadline = if from_now {
            Instant::now() + new_delay
        } else {
            *self.shared.deadline.lock().unwrap() + new_delay
        };
        self.reschedule(new_deadline);
        Ok(())
    }

    fn reschedule(&self, new_deadline: Instant) {
        *self.shared.deadline.lock().unwrap() = new_deadline;
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.manager.heap.write().unwrap().push(HeapEntry {
            deadline: new_deadline,
            id: self.shared.id,
            generation,
            shared: self.shared.clone(),
        });
    }
}

struct ManagerInner {
    heap: RwLock<BinaryHeap<HeapEntry>>,
    last_now: Mutex<Instant>,
}

/// Threshold beyond which `now` appearing to move backwards relative to the
/// last observed time is treated as a clock rollback rather than measurement
/// noise, and flushes every pending timer as expired.
const CLOCK_ROLLBACK_THRESHOLD: Duration = Duration::from_secs(3600);

/// A `RwLock`-protected min-heap of timer deadlines.
pub struct TimerManager {
    inner: Arc<ManagerInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                heap: RwLock::new(BinaryHeap::new()),
                last_now: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Schedules `callback` to run after `delay`. If `recurring`, it fires
    /// again every `delay` thereafter (subject to the no-catch-up rule
    /// described on [`TimerManager::list_expired`]).
    pub fn add_timer(
        &self,
        delay: Duration,
        callback: impl FnMut() + Send + 'static,
        recurring: bool,
    ) -> TimerHandle {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + delay;
        let shared = Arc::new(Shared {
            id,
            callback: Mutex::new(Box::new(callback)),
            deadline: Mutex::new(deadline),
            period: Mutex::new(if recurring { delay } else { Duration::ZERO }),
            canceled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });
        self.inner.heap.write().unwrap().push(HeapEntry {
            deadline,
            id,
            generation: 0,
            shared: shared.clone(),
        });
        TimerHandle {
            shared,
            manager: self.inner.clone(),
        }
    }

    /// Duration until the earliest non-canceled timer, or `None` if there
    /// are none pending. Takes the write lock: discarding stale entries
    /// ahead of the live one requires popping them permanently.
    pub fn next_timeout(&self) -> Option<Duration> {
        let now = self.check_rollback();
        let mut heap = self.inner.heap.write().unwrap();
        while matches!(heap.peek(), Some(e) if e.is_stale()) {
            heap.pop();
        }
        let deadline = heap.peek()?.deadline;
        Some(deadline.saturating_duration_since(now))
    }

    /// Pops every timer whose deadline has passed, returning the ones that
    /// should fire (stale or canceled entries are silently discarded).
    /// Recurring timers are re-inserted with `deadline += period`; if that's
    /// still in the past (a long stall, or the clock-rollback case) the new
    /// deadline is `now + period` instead of looping forward, so a backlog
    /// never produces more than one callback invocation per period.
    pub fn list_expired(&self) -> Vec<Arc<Shared>> {
        let now = self.check_rollback();
        let mut fired = Vec::new();
        let mut heap = self.inner.heap.write().unwrap();

        while let Some(entry) = heap.peek() {
            if entry.is_stale() {
                heap.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            let entry = heap.pop().unwrap();
            let period = *entry.shared.period.lock().unwrap();
            if period.is_zero() {
                entry.shared.fired.store(true, Ordering::Release);
            } else {
                let mut next_deadline = entry.deadline + period;
                if next_deadline <= now {
                    next_deadline = now + period;
                }
                *entry.shared.deadline.lock().unwrap() = next_deadline;
                let generation = entry.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
                heap.push(HeapEntry {
                    deadline: next_deadline,
                    id: entry.id,
                    generation,
                    shared: entry.shared.clone(),
                });
            }
            fired.push(entry.shared);
        }

        fired
    }

    pub fn is_empty(&self) -> bool {
        self.inner.heap.read().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.heap.read().unwrap().len()
    }

    fn check_rollback(&self) -> Instant {
        let now = Instant::now();
        let mut last_now = self.inner.last_now.lock().unwrap();
        let rolled_back = match last_now.checked_duration_since(now) {
            Some(backwards) => backwards > CLOCK_ROLLBACK_THRESHOLD,
            None => false,
        };
        if rolled_back {
            tracing::warn!("clock rollback detected, flushing all timers as expired");
            let mut heap = self.inner.heap.write().unwrap();
            let stale_future = std::mem::take(&mut *heap);
            for mut entry in stale_future {
                entry.deadline = now;
                heap.push(entry);
            }
        }
        *last_now = now;
        now
    }
}

/// Invokes a fired timer's callback. Exposed so [`crate::io::IoManager`] can
/// wrap it as a [`crate::task::Task::Callable`] without reaching into
/// [`Shared`]'s private fields.
pub(crate) fn fire(shared: &Arc<Shared>) {
    shared.invoke();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_fires_once() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _handle = mgr.add_timer(Duration::from_millis(1), move || {
            c.fetch_add(1, Ordering::Relaxed);
        }, false);

        std::thread::sleep(Duration::from_millis(20));
        let fired = mgr.list_expired();
        assert_eq!(fired.len(), 1);
        for f in &fired {
            fire(f);
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(mgr.list_expired().is_empty());
    }

    #[test]
    fn canceled_timer_never_fires() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(Duration::from_millis(1), || {}, false);
        handle.cancel();
        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.list_expired().is_empty());
    }

    #[test]
    fn recurring_timer_reschedules() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = mgr.add_timer(
            Duration::from_millis(5),
            move || {
                c.fetch_add(1, Ordering::Relaxed);
            },
            true,
        );

        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            for f in mgr.list_expired() {
                fire(&f);
            }
        }
        assert!(count.load(Ordering::Relaxed) >= 2);
        handle.cancel();
    }

    #[test]
    fn next_timeout_reflects_earliest_deadline() {
        let mgr = TimerManager::new();
        assert!(mgr.next_timeout().is_none());
        let _a = mgr.add_timer(Duration::from_secs(10), || {}, false);
        let _b = mgr.add_timer(Duration::from_millis(1), || {}, false);
        let t = mgr.next_timeout().unwrap();
        assert!(t <= Duration::from_secs(10));
    }

    #[test]
    fn refresh_extends_deadline() {
        let mgr = TimerManager::new();
        let handle = mgr.add_timer(Duration::from_millis(50), || {}, false);
        std::thread::sleep(Duration::from_millis(10));
        handle.refresh().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(mgr.list_expired().is_empty());
    }
}
