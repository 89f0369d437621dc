//! epoll-backed extension of [`Scheduler`]: fibers block on file
//! descriptor readiness instead of OS threads blocking on `read`/`write`.
//! Spec section 4.3.
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;
use log::{error, trace, warn};

use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::scheduler::{Driver, Scheduler, Task};
use crate::timer::{Timer, TimerManager};

bitflags! {
    /// Readiness events an [`IOManager`] can wait on for a file descriptor.
    /// `EPOLLERR`/`EPOLLHUP` are folded into both bits on delivery (spec
    /// section 3, "IOManager" invariants), since a reader and a writer may
    /// both be waiting on the same fd and both need to observe the error.
    #[derive(Default)]
    pub struct Event: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn event_to_epoll(events: Event) -> u32 {
    let mut bits = 0u32;
    if events.contains(Event::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if events.contains(Event::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

/// One pending waiter: which fiber to resume, and what to run instead if
/// no callback was supplied (the common "resume the calling fiber" case).
enum Waiter {
    ResumeFiber(Fiber),
    RunCallback(Arc<dyn Fn() + Send + Sync>),
}

impl Waiter {
    fn fire(self, scheduler: &Scheduler) {
        match self {
            Waiter::ResumeFiber(f) => {
                // The fiber yielded `Suspended` when it registered this
                // waiter; bring it back to `Ready` before handing it to
                // the scheduler, which requires that precondition.
                f.mark_ready();
                let _ = scheduler.schedule(Task::from_fiber(f));
            }
            Waiter::RunCallback(cb) => {
                let _ = scheduler.schedule(Task::from_fn(move || cb()));
            }
        }
    }
}

#[derive(Default)]
struct FdContext {
    registered: Event,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdContext {
    fn waiter_mut(&mut self, event: Event) -> &mut Option<Waiter> {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

struct IOManagerState {
    epoll_fd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    contexts: RwLock<HashMap<RawFd, Mutex<FdContext>>>,
    pending_events: AtomicUsize,
    timers: TimerManager,
}

impl Drop for IOManagerState {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_read);
            libc::close(self.tickle_write);
        }
    }
}

/// epoll-backed [`Driver`]; construct via [`IOManager::new`], which wires
/// itself into a fresh [`Scheduler`].
pub struct IOManager {
    state: Arc<IOManagerState>,
}

// The raw fds above are never touched concurrently without the RwLock/
// Mutex guarding them; epoll_fd itself is safe for any thread to wait on.
unsafe impl Send for IOManagerState {}
unsafe impl Sync for IOManagerState {}

impl IOManager {
    /// Builds an epoll instance, a self-pipe for waking idle workers out
    /// of `epoll_wait`, and a [`Scheduler`] configured to use it.
    pub fn new(thread_count: usize, use_caller: bool, name: impl Into<String>) -> (Scheduler, Arc<IOManager>) {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(epoll_fd >= 0, "epoll_create1 failed");

        let mut pipe_fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert!(rc == 0, "pipe2 failed");
        let (tickle_read, tickle_write) = (pipe_fds[0], pipe_fds[1]);

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32 | libc::EPOLLET as u32,
            u64: tickle_read as u64,
        };
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_read, &mut ev)
        };
        assert!(rc == 0, "failed to register tickle pipe with epoll");

        // A newly scheduled timer with an earlier deadline than anything
        // epoll_wait was told to wait for needs to interrupt that wait;
        // wiring the timer manager's front-changed hook to the self-pipe
        // does that without the timer manager knowing anything about
        // epoll.
        let timers = TimerManager::with_front_changed_hook(move |_next_due_ms| {
            let byte = 1u8;
            unsafe {
                libc::write(tickle_write, &byte as *const u8 as *const libc::c_void, 1);
            }
        });

        let state = Arc::new(IOManagerState {
            epoll_fd,
            tickle_read,
            tickle_write,
            contexts: RwLock::new(HashMap::new()),
            pending_events: AtomicUsize::new(0),
            timers,
        });
        let manager = Arc::new(IOManager { state });
        let scheduler =
            Scheduler::with_driver(thread_count, use_caller, name, manager.clone() as Arc<dyn Driver>);
        (scheduler, manager)
    }

    /// The timer manager coupled to this IO manager's idle loop: timers
    /// are checked (and epoll's wait timeout bounded by the next
    /// deadline) on every idle pass, whether or not any fd is ready.
    pub fn timers(&self) -> &TimerManager {
        &self.state.timers
    }

    /// Schedules `callback` to run `delay_ms` from now, on this manager's
    /// scheduler. Convenience wrapper over [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, delay_ms: u64, callback: F) -> Timer
    where
        F: FnMut() + Send + 'static,
    {
        self.state.timers.add_timer(delay_ms, callback)
    }

    /// Registers interest in `event` on `fd`; when it fires, `waiter` is
    /// resumed/run exactly once. The registration is edge-triggered
    /// (`EPOLLET`) plus one-shot (`EPOLLONESHOT`): edge-triggered so a
    /// level that's already been reported doesn't re-fire epoll_wait every
    /// pass, one-shot so a partially-consumed registration (e.g. only the
    /// read side fired) doesn't re-deliver to a waiter that already ran.
    fn add_event_inner(&self, fd: RawFd, event: Event, waiter: Waiter) -> Result<()> {
        let contexts = self.state.contexts.read().unwrap();
        if let Some(ctx_lock) = contexts.get(&fd) {
            let mut ctx = ctx_lock.lock().unwrap();
            if ctx.registered.contains(event) {
                return Err(Error::DuplicateEvent { fd, event });
            }
            let new_mask = ctx.registered | event;
            self.epoll_mod(fd, new_mask)?;
            ctx.registered = new_mask;
            *ctx.waiter_mut(event) = Some(waiter);
            self.state.pending_events.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        drop(contexts);

        let mut contexts = self.state.contexts.write().unwrap();
        let ctx_lock = contexts
            .entry(fd)
            .or_insert_with(|| Mutex::new(FdContext::default()));
        let mut ctx = ctx_lock.lock().unwrap();
        if ctx.registered.contains(event) {
            return Err(Error::DuplicateEvent { fd, event });
        }
        let new_mask = ctx.registered | event;
        self.epoll_add_or_mod(fd, new_mask, ctx.registered.is_empty())?;
        ctx.registered = new_mask;
        *ctx.waiter_mut(event) = Some(waiter);
        self.state.pending_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Resumes the calling fiber once `fd` becomes ready for `event`,
    /// yielding in the meantime. The common case, used by [`crate::hook`].
    pub fn add_event_and_yield(&self, fd: RawFd, event: Event) -> Result<()> {
        self.add_event_inner(fd, event, Waiter::ResumeFiber(Fiber::current()))?;
        Fiber::yield_suspended();
        Ok(())
    }

    /// Registers `event` on `fd`; `callback` runs (on some worker) when it
    /// fires instead of resuming any particular fiber.
    pub fn add_event_with_callback<F>(&self, fd: RawFd, event: Event, callback: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_event_inner(fd, event, Waiter::RunCallback(Arc::new(callback)))
    }

    fn epoll_mod(&self, fd: RawFd, mask: Event) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: event_to_epoll(mask) | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.state.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc != 0 {
            return Err(Error::System(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn epoll_add_or_mod(&self, fd: RawFd, mask: Event, is_new: bool) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: event_to_epoll(mask) | libc::EPOLLET as u32 | libc::EPOLLONESHOT as u32,
            u64: fd as u64,
        };
        let op = if is_new {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let rc = unsafe { libc::epoll_ctl(self.state.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(Error::System(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Deregisters one event, dropping its waiter without firing it.
    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<()> {
        self.remove_event(fd, event)?;
        Ok(())
    }

    /// Like [`IOManager::del_event`], but fires the waiter once (with no
    /// readiness, as a cancellation notice) instead of dropping it silently.
    pub fn cancel_event(&self, fd: RawFd, event: Event, scheduler: &Scheduler) -> Result<()> {
        let waiter = self.remove_event(fd, event)?;
        if let Some(w) = waiter {
            w.fire(scheduler);
        }
        Ok(())
    }

    /// Shared epoll/bookkeeping teardown for one (fd, event) pair; returns
    /// the waiter that was registered, if any, leaving firing it up to the
    /// caller.
    fn remove_event(&self, fd: RawFd, event: Event) -> Result<Option<Waiter>> {
        let contexts = self.state.contexts.read().unwrap();
        let ctx_lock = contexts.get(&fd).ok_or(Error::NoSuchFd(fd))?;
        let mut ctx = ctx_lock.lock().unwrap();
        if !ctx.registered.contains(event) {
            return Err(Error::NoSuchEvent { fd, event });
        }
        let new_mask = ctx.registered - event;
        if new_mask.is_empty() {
            let rc = unsafe {
                libc::epoll_ctl(self.state.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if rc != 0 {
                return Err(Error::System(std::io::Error::last_os_error()));
            }
        } else {
            self.epoll_mod(fd, new_mask)?;
        }
        ctx.registered = new_mask;
        let waiter = ctx.waiter_mut(event).take();
        self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
        Ok(waiter)
    }

    /// Cancels every event registered on `fd`, firing each waiter that was
    /// armed (spec section 4.3, `CancelAll`).
    pub fn cancel_all(&self, fd: RawFd, scheduler: &Scheduler) -> Result<()> {
        let (read, write) = {
            let contexts = self.state.contexts.read().unwrap();
            let ctx_lock = contexts.get(&fd).ok_or(Error::NoSuchFd(fd))?;
            let mut ctx = ctx_lock.lock().unwrap();
            if ctx.registered.contains(Event::READ) {
                self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            if ctx.registered.contains(Event::WRITE) {
                self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
            }
            if !ctx.registered.is_empty() {
                unsafe {
                    libc::epoll_ctl(self.state.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
            }
            ctx.registered = Event::empty();
            (ctx.read.take(), ctx.write.take())
        };
        if let Some(w) = read {
            w.fire(scheduler);
        }
        if let Some(w) = write {
            w.fire(scheduler);
        }
        Ok(())
    }

    pub fn pending_events(&self) -> usize {
        self.state.pending_events.load(Ordering::SeqCst)
    }

    fn tickle_byte(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.state.tickle_write, &byte as *const u8 as *const libc::c_void, 1);
        }
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(self.state.tickle_read, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Driver for IOManager {
    fn idle_once(&self, scheduler: &Scheduler) {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        // Never wait past the next timer deadline, and never block
        // forever once stopping (a short timeout lets `stopping()` be
        // re-checked promptly instead of waiting on the next fd).
        let timeout_ms = match (self.state.timers.next_timeout_ms(), scheduler.is_stopping()) {
            (_, true) => 10,
            (Some(ms), false) => ms.min(i32::MAX as u64) as i32,
            (None, false) => -1,
        };

        let n = unsafe {
            libc::epoll_wait(self.state.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        self.state.timers.run_expired();
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                error!("epoll_wait failed: {err}");
            }
            return;
        }

        for raw_event in &events[..n as usize] {
            let fd = raw_event.u64 as RawFd;
            if fd == self.state.tickle_read {
                self.drain_tickle_pipe();
                continue;
            }
            let mut fired_read = None;
            let mut fired_write = None;
            {
                let contexts = self.state.contexts.read().unwrap();
                let ctx_lock = match contexts.get(&fd) {
                    Some(c) => c,
                    None => continue,
                };
                let mut ctx = ctx_lock.lock().unwrap();
                // EPOLLERR/EPOLLHUP imply readiness (with an error) on
                // whichever side(s) are registered -- both a pending
                // reader and a pending writer need to observe it.
                let is_error = raw_event.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
                let readable = is_error || raw_event.events & libc::EPOLLIN as u32 != 0;
                let writable = is_error || raw_event.events & libc::EPOLLOUT as u32 != 0;

                if readable && ctx.registered.contains(Event::READ) {
                    fired_read = ctx.read.take();
                    ctx.registered.remove(Event::READ);
                    self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if writable && ctx.registered.contains(Event::WRITE) {
                    fired_write = ctx.write.take();
                    ctx.registered.remove(Event::WRITE);
                    self.state.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
                if !ctx.registered.is_empty() {
                    let mask = ctx.registered;
                    drop(ctx);
                    if let Err(e) = self.epoll_mod(fd, mask) {
                        warn!("failed to re-arm fd {fd} after partial fire: {e}");
                    }
                }
            }
            if let Some(w) = fired_read {
                trace!("fd {fd} readable, firing waiter");
                w.fire(scheduler);
            }
            if let Some(w) = fired_write {
                trace!("fd {fd} writable, firing waiter");
                w.fire(scheduler);
            }
        }
    }

    fn tickle(&self, scheduler: &Scheduler) {
        if scheduler.has_idle_threads() {
            self.tickle_byte();
        }
    }

    fn extra_stopping(&self) -> bool {
        self.pending_events() == 0 && self.state.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn s3_tcp_like_fd_wakes_fiber_on_readability() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let b_fd = b.as_raw_fd();

        let (scheduler, manager) = IOManager::new(1, true, "s3");
        let got = Arc::new(Mutex::new(Vec::new()));
        let got2 = got.clone();

        scheduler.schedule_fn(move || {
            manager.add_event_and_yield(b_fd, Event::READ).unwrap();
            let mut buf = [0u8; 5];
            let n = std::io::Read::read(&mut b, &mut buf).unwrap();
            got2.lock().unwrap().extend_from_slice(&buf[..n]);
        }).unwrap();

        scheduler.start();
        a.write_all(b"hello").unwrap();
        scheduler.stop();

        assert_eq!(&got.lock().unwrap()[..], b"hello");
    }

    #[test]
    fn duplicate_event_registration_is_rejected() {
        let (mut _a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();
        let (_scheduler, manager) = IOManager::new(1, true, "dup");
        manager
            .add_event_with_callback(fd, Event::READ, || {})
            .unwrap();
        let err = manager
            .add_event_with_callback(fd, Event::READ, || {})
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DuplicateEvent);
    }

    #[test]
    fn cancel_event_fires_its_waiter() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();
        let (scheduler, manager) = IOManager::new(1, true, "cancel-event");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        manager
            .add_event_with_callback(fd, Event::READ, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        manager.cancel_event(fd, Event::READ, &scheduler).unwrap();
        scheduler.start();
        scheduler.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn del_event_drops_its_waiter_without_firing() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();
        let (scheduler, manager) = IOManager::new(1, true, "del-event");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        manager
            .add_event_with_callback(fd, Event::READ, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        manager.del_event(fd, Event::READ).unwrap();
        scheduler.start();
        scheduler.stop();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_all_fires_every_registered_waiter() {
        let (_a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let fd = b.as_raw_fd();
        let (scheduler, manager) = IOManager::new(1, true, "cancel-all");
        let read_fired = Arc::new(AtomicUsize::new(0));
        let write_fired = Arc::new(AtomicUsize::new(0));
        let rf = read_fired.clone();
        let wf = write_fired.clone();
        manager
            .add_event_with_callback(fd, Event::READ, move || {
                rf.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        manager
            .add_event_with_callback(fd, Event::WRITE, move || {
                wf.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        manager.cancel_all(fd, &scheduler).unwrap();
        scheduler.start();
        scheduler.stop();

        assert_eq!(read_fired.load(Ordering::SeqCst), 1);
        assert_eq!(write_fired.load(Ordering::SeqCst), 1);
    }
}
