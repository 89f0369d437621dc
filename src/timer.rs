//! Monotonic timer wheel: fires one-shot and recurring callbacks in fire-
//! time order. Spec section 4.4 / section 3 ("Timer").
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::clock::monotonic_ms;
use crate::error::{Error, Result};

pub type TimerId = u64;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

struct Entry {
    id: TimerId,
    fire_at_ms: u64,
    period_ms: Option<u64>,
    /// The delay this timer was first armed with. `refresh()` reuses it for
    /// one-shot timers, which have no `period_ms` to fall back on.
    initial_delay_ms: u64,
    callback: Box<dyn FnMut() + Send>,
    /// A recurring timer that only fires while this (if present) is still
    /// alive. Spec: "weak-condition timers".
    condition: Option<Weak<()>>,
    cancelled: bool,
}

#[derive(PartialEq, Eq, Clone, Copy)]
struct HeapKey(u64, TimerId);

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0).then(self.1.cmp(&other.1))
    }
}

struct State {
    heap: BinaryHeap<Reverse<HeapKey>>,
    entries: HashMap<TimerId, Entry>,
}

/// A set of pending timers, ordered by fire time. Cheap to clone; all
/// clones name the same manager.
#[derive(Clone)]
pub struct TimerManager {
    state: Arc<Mutex<State>>,
    /// Invoked whenever the earliest fire time changes, so a driver (e.g.
    /// [`crate::io_manager::IOManager`]) can tickle itself awake instead
    /// of blocking past the new deadline in `epoll_wait`.
    on_front_changed: Arc<dyn Fn(u64) + Send + Sync>,
}

/// A handle to a single scheduled timer.
pub struct Timer {
    id: TimerId,
    manager: TimerManager,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Cancels this timer; a no-op if it already fired or was cancelled.
    pub fn cancel(&self) {
        self.manager.cancel(self.id);
    }

    /// Reschedules this timer to fire from now, reusing its own period (for
    /// a recurring timer) or its original delay (for a one-shot one),
    /// keeping the same callback. Spec section 6, `Timer::refresh()`.
    /// Errs with `InvalidState` if the timer already fired or was
    /// cancelled.
    pub fn refresh(&self) -> Result<()> {
        self.manager.refresh(self.id)
    }

    /// Replaces both the delay and whether this timer recurs. Errs with
    /// `InvalidState` under the same condition as [`Timer::refresh`].
    pub fn reset(&self, delay_ms: u64, period_ms: Option<u64>) -> Result<()> {
        self.manager.reset(self.id, delay_ms, period_ms)
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        Self::with_front_changed_hook(|_| {})
    }

    pub(crate) fn with_front_changed_hook<F>(hook: F) -> TimerManager
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        TimerManager {
            state: Arc::new(Mutex::new(State {
                heap: BinaryHeap::new(),
                entries: HashMap::new(),
            })),
            on_front_changed: Arc::new(hook),
        }
    }

    fn insert(
        &self,
        delay_ms: u64,
        period_ms: Option<u64>,
        condition: Option<Weak<()>>,
        callback: Box<dyn FnMut() + Send>,
    ) -> Timer {
        let fire_at_ms = monotonic_ms() + delay_ms;
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let was_front = state.heap.peek().map(|Reverse(k)| k.0);
        state.heap.push(Reverse(HeapKey(fire_at_ms, id)));
        state.entries.insert(
            id,
            Entry {
                id,
                fire_at_ms,
                period_ms,
                initial_delay_ms: delay_ms,
                callback,
                condition,
                cancelled: false,
            },
        );
        let now_front = state.heap.peek().map(|Reverse(k)| k.0);
        drop(state);
        if now_front != was_front {
            if let Some(front) = now_front {
                (self.on_front_changed)(front);
            }
        }
        Timer {
            id,
            manager: self.clone(),
        }
    }

    /// Fires once, `delay_ms` from now.
    pub fn add_timer<F>(&self, delay_ms: u64, callback: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(delay_ms, None, None, Box::new(callback))
    }

    /// Fires every `period_ms`, starting `period_ms` from now.
    pub fn add_recurring_timer<F>(&self, period_ms: u64, callback: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(period_ms, Some(period_ms), None, Box::new(callback))
    }

    /// Like [`TimerManager::add_recurring_timer`], but each firing is
    /// skipped once `condition` can no longer be upgraded -- lets a caller
    /// tie a timer's lifetime to some other object without an explicit
    /// cancel.
    pub fn add_condition_timer<F>(
        &self,
        period_ms: u64,
        condition: Weak<()>,
        callback: F,
    ) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(period_ms, Some(period_ms), Some(condition), Box::new(callback))
    }

    fn cancel(&self, id: TimerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.cancelled = true;
        }
    }

    /// Reuses the entry's own period (or its original one-shot delay) as
    /// the new delay from now.
    fn refresh(&self, id: TimerId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entries
            .get(&id)
            .filter(|e| !e.cancelled)
            .ok_or_else(|| Error::invalid_state("pending timer", "already fired or cancelled"))?;
        let delay_ms = entry.period_ms.unwrap_or(entry.initial_delay_ms);
        let new_fire_at = monotonic_ms() + delay_ms;
        state.entries.get_mut(&id).unwrap().fire_at_ms = new_fire_at;
        state.heap.push(Reverse(HeapKey(new_fire_at, id)));
        Ok(())
    }

    fn reset(&self, id: TimerId, delay_ms: u64, period_ms: Option<u64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.entries.get(&id).map_or(false, |e| !e.cancelled) {
            return Err(Error::invalid_state(
                "pending timer",
                "already fired or cancelled",
            ));
        }
        let new_fire_at = monotonic_ms() + delay_ms;
        let entry = state.entries.get_mut(&id).unwrap();
        entry.fire_at_ms = new_fire_at;
        entry.period_ms = period_ms;
        entry.initial_delay_ms = delay_ms;
        state.heap.push(Reverse(HeapKey(new_fire_at, id)));
        Ok(())
    }

    /// Milliseconds until the next timer is due, or `None` if there are no
    /// live timers. Used by a driver's idle pass to bound how long it may
    /// block (e.g. `epoll_wait`'s timeout).
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        let now = monotonic_ms();
        next_live_fire_time(&state).map(|at| at.saturating_sub(now))
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        next_live_fire_time(&state).is_none()
    }

    /// Pops and runs every timer whose fire time has passed, rescheduling
    /// recurring ones. Lazily drops stale heap entries (cancelled timers,
    /// or a timer that already fired and was later re-pushed by
    /// `refresh`/`reset`, leaving its old heap key behind).
    pub fn run_expired(&self) {
        loop {
            let due = {
                let mut state = self.state.lock().unwrap();
                match pop_due(&mut state, monotonic_ms()) {
                    Some(entry) => entry,
                    None => break,
                }
            };
            self.fire(due);
        }
    }

    fn fire(&self, mut entry: Entry) {
        if let Some(cond) = &entry.condition {
            if cond.upgrade().is_none() {
                trace!("timer {} skipped, condition dropped", entry.id);
                return;
            }
        }
        (entry.callback)();
        if let Some(period) = entry.period_ms {
            let fire_at_ms = monotonic_ms() + period;
            let mut state = self.state.lock().unwrap();
            let id = entry.id;
            state.heap.push(Reverse(HeapKey(fire_at_ms, id)));
            entry.fire_at_ms = fire_at_ms;
            state.entries.insert(id, entry);
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn next_live_fire_time(state: &State) -> Option<u64> {
    state
        .heap
        .iter()
        .filter(|Reverse(k)| state.entries.get(&k.1).map_or(false, |e| !e.cancelled))
        .map(|Reverse(k)| k.0)
        .min()
}

/// Pops heap entries until one names a still-live, due entry (or the heap
/// is exhausted / the front isn't due yet). Stale pops (cancelled timers,
/// or a key superseded by a later `refresh`) are silently discarded.
fn pop_due(state: &mut State, now: u64) -> Option<Entry> {
    loop {
        let Reverse(HeapKey(fire_at, id)) = *state.heap.peek()?;
        if fire_at > now {
            return None;
        }
        state.heap.pop();
        match state.entries.get(&id) {
            Some(entry) if entry.cancelled => {
                state.entries.remove(&id);
                continue;
            }
            Some(entry) if entry.fire_at_ms != fire_at => {
                // Superseded by a later refresh/reset; this heap key is stale.
                continue;
            }
            Some(_) => return state.entries.remove(&id),
            None => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn s4_idempotent_single_fire() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let _t = mgr.add_timer(10, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(30));
        mgr.run_expired();
        mgr.run_expired();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_before_fire_prevents_callback() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = mgr.add_timer(10, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        t.cancel();
        std::thread::sleep(Duration::from_millis(30));
        mgr.run_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn s5_recurring_timer_stops_once_condition_drops() {
        let mgr = TimerManager::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let guard = Arc::new(());
        let weak = Arc::downgrade(&guard);
        let l = log.clone();
        let _t = mgr.add_condition_timer(10, weak, move || {
            l.lock().unwrap().push(());
        });

        std::thread::sleep(Duration::from_millis(15));
        mgr.run_expired();
        assert_eq!(log.lock().unwrap().len(), 1);

        drop(guard);
        std::thread::sleep(Duration::from_millis(15));
        mgr.run_expired();
        // The condition is gone: the callback must not run again, though
        // the recurring entry itself may still repost internally.
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn refresh_delays_a_one_shot_timer_by_its_original_delay() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = mgr.add_timer(20, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(10));
        t.refresh().unwrap();
        std::thread::sleep(Duration::from_millis(15));
        mgr.run_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "refresh should have pushed the deadline back");

        std::thread::sleep(Duration::from_millis(15));
        mgr.run_expired();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn refresh_after_firing_reports_invalid_state() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(5, || {});
        std::thread::sleep(Duration::from_millis(20));
        mgr.run_expired();
        assert!(t.refresh().is_err());
    }

    #[test]
    fn next_timeout_reflects_earliest_pending_timer() {
        let mgr = TimerManager::new();
        assert!(mgr.next_timeout_ms().is_none());
        let _t = mgr.add_timer(1000, || {});
        assert!(mgr.next_timeout_ms().unwrap() <= 1000);
    }
}
