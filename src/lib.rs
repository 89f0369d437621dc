//! A fused stackful-coroutine scheduler, epoll-backed I/O manager and
//! monotonic timer wheel for building single-process, multi-threaded async
//! servers without an external async runtime.
//!
//! Four subsystems, each usable on its own:
//!
//! - [`fiber`] -- stackful coroutines (`ucontext`-based), cooperatively
//!   scheduled within one OS thread at a time.
//! - [`scheduler`] -- an M:N dispatcher that runs fibers (and plain
//!   closures) across a fixed pool of worker threads.
//! - [`io_manager`] -- an epoll-backed [`scheduler::Driver`] that parks a
//!   fiber until a file descriptor becomes readable/writable.
//! - [`timer`] -- a fire-time-ordered timer wheel, wired into
//!   [`io_manager::IOManager`] so a newly-registered earlier deadline
//!   interrupts an in-progress `epoll_wait`.
//!
//! [`hook`] and [`sync`] build ordinary-looking blocking APIs (TCP I/O,
//! `sleep`, a mutex, a bounded queue) on top of those four without ever
//! blocking the underlying OS thread.
//!
//! This crate does not attempt kernel-bypass I/O, preemptive scheduling,
//! cross-process work stealing, fair-share/priority scheduling, or dynamic
//! stack growth -- fibers run cooperatively, to completion or the next
//! yield, on a stack sized once at spawn time.
pub mod clock;
pub mod config;
pub mod error;
pub mod fiber;
pub mod hook;
pub mod io_manager;
pub mod scheduler;
pub mod sync;
pub mod timer;

pub use error::{Error, ErrorCode, Result};
pub use fiber::{Fiber, FiberId, State as FiberState};
pub use hook::{sleep_ms, TcpListener, TcpStream};
pub use io_manager::{Event, IOManager};
pub use scheduler::{Scheduler, Task};
pub use sync::{BlockingQueue, FiberMutex, FiberMutexGuard};
pub use timer::{Timer, TimerId, TimerManager};

/// Schedules `f` onto the calling thread's current [`Scheduler`], if any.
///
/// A thin convenience wrapper over [`Scheduler::current`] +
/// [`Scheduler::schedule_fn`] for call sites that don't want to thread a
/// `Scheduler` handle through. Returns `false` (and drops `f` without
/// running it) if called from a thread with no current scheduler, or if
/// that scheduler has already been stopped.
pub fn schedule<F>(f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    match Scheduler::current() {
        Some(scheduler) => scheduler.schedule_fn(f).is_ok(),
        None => false,
    }
}

/// The [`Scheduler`] driving the calling thread, if any.
pub fn current_scheduler() -> Option<Scheduler> {
    Scheduler::current()
}

/// The [`Fiber`] currently running on the calling thread.
///
/// Every OS thread has one, lazily created on first access: a thread
/// outside any [`Scheduler`] is still running "as" its own thread-main
/// fiber.
pub fn current_fiber() -> Fiber {
    Fiber::current()
}

/// Shorthand for `current_fiber().id()`.
pub fn current_fiber_id() -> FiberId {
    Fiber::current_id()
}
