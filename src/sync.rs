//! Fiber-aware synchronization: a mutex and a bounded queue whose waiters
//! yield instead of blocking the OS thread, grounded on the cooperative
//! lock in the system this crate's core is ported from. Built entirely on
//! [`crate::fiber`] and [`crate::scheduler`] primitives -- no OS mutex
//! contention or blocking syscall ever sits on a worker thread's
//! critical path, per spec section 4 ("Suspension points").
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::fiber::Fiber;
use crate::scheduler::{Scheduler, Task};

/// A mutex whose `lock()` suspends the calling fiber (instead of blocking
/// its OS thread) while contended.
///
/// The `locked`/`waiters` bookkeeping sits behind a short-lived `Mutex`;
/// `value` sits behind a bare `UnsafeCell` guarded by the `locked` flag's
/// exclusivity invariant instead, so reading it never needs to take that
/// lock (and can't deadlock against it).
pub struct FiberMutex<T> {
    state: Mutex<MutexState>,
    value: UnsafeCell<T>,
}

struct MutexState {
    locked: bool,
    waiters: VecDeque<Fiber>,
}

unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> FiberMutex<T> {
        FiberMutex {
            state: Mutex::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Waits indefinitely until the current fiber can gain access to the
    /// mutex. Precondition: called from a fiber scheduled on some
    /// [`Scheduler`] -- a standalone fiber would have no one to wake it.
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.locked {
                    state.locked = true;
                    return FiberMutexGuard { mutex: self };
                }
                state.waiters.push_back(Fiber::current());
            }
            Fiber::yield_suspended();
        }
    }

    fn unlock(&self) {
        let next = {
            let mut state = self.state.lock().unwrap();
            state.locked = false;
            state.waiters.pop_front()
        };
        if let Some(fiber) = next {
            wake(fiber);
        }
    }
}

fn wake(fiber: Fiber) {
    fiber.mark_ready();
    if let Some(scheduler) = Scheduler::current() {
        let _ = scheduler.schedule(Task::from_fiber(fiber));
    }
}

/// RAII guard returned by [`FiberMutex::lock`]; unlocks (and wakes the
/// next waiter, if any) on drop.
pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<'a, T> std::ops::Deref for FiberMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<'a, T> std::ops::DerefMut for FiberMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<'a, T> Drop for FiberMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// A bounded multi-producer multi-consumer queue whose `push`/`pop`
/// suspend the calling fiber on full/empty instead of blocking the
/// worker thread.
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    readers: VecDeque<Fiber>,
    writers: VecDeque<Fiber>,
}

impl<T> BlockingQueue<T> {
    pub fn new(capacity: usize) -> BlockingQueue<T> {
        assert!(capacity > 0, "BlockingQueue capacity must be positive");
        BlockingQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                readers: VecDeque::new(),
                writers: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn push(&self, value: T) {
        let mut value = Some(value);
        loop {
            let reader = {
                let mut state = self.state.lock().unwrap();
                if state.items.len() < self.capacity {
                    state.items.push_back(value.take().unwrap());
                    state.readers.pop_front()
                } else {
                    state.writers.push_back(Fiber::current());
                    None
                }
            };
            if let Some(fiber) = reader {
                wake(fiber);
            }
            if value.is_none() {
                return;
            }
            Fiber::yield_suspended();
        }
    }

    /// Suspends the calling fiber while the queue is empty. Spec scenario
    /// S4-adjacent: any fiber-aware primitive that registers a wake-up
    /// condition and yields, matching the "Suspension points" invariant.
    pub fn pop(&self) -> T {
        loop {
            let (item, writer) = {
                let mut state = self.state.lock().unwrap();
                match state.items.pop_front() {
                    Some(item) => (Some(item), state.writers.pop_front()),
                    None => {
                        state.readers.push_back(Fiber::current());
                        (None, None)
                    }
                }
            };
            if let Some(fiber) = writer {
                wake(fiber);
            }
            if let Some(item) = item {
                return item;
            }
            Fiber::yield_suspended();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn mutex_serializes_contending_fibers() {
        let sc = Scheduler::new(1, true, "mutex-test");
        let mutex = Arc::new(FiberMutex::new(0u32));
        let log = Arc::new(StdMutex::new(Vec::new()));

        for id in 0..3 {
            let m = mutex.clone();
            let l = log.clone();
            sc.schedule_fn(move || {
                let mut guard = m.lock();
                *guard += 1;
                l.lock().unwrap().push((id, *guard));
            }).unwrap();
        }

        sc.start();
        sc.stop();

        let final_value = *mutex.lock();
        assert_eq!(final_value, 3);
        let seen: Vec<u32> = log.lock().unwrap().iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn blocking_queue_delivers_in_fifo_order() {
        let sc = Scheduler::new(1, true, "queue-test");
        let queue = Arc::new(BlockingQueue::new(2));
        let received = Arc::new(StdMutex::new(Vec::new()));

        let q = queue.clone();
        sc.schedule_fn(move || {
            q.push(1);
            q.push(2);
            q.push(3);
        }).unwrap();

        let q2 = queue.clone();
        let r = received.clone();
        sc.schedule_fn(move || {
            for _ in 0..3 {
                r.lock().unwrap().push(q2.pop());
            }
        }).unwrap();

        sc.start();
        sc.stop();

        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
    }
}
