//! User-space stackful coroutines.
//!
//! A [`Fiber`] owns a fixed-size stack and a saved machine context.
//! `resume`/`yield` switch between it and its *peer* -- the scheduler's
//! dispatch fiber for task fibers, or the OS thread's thread-main fiber for
//! standalone ones. See spec section 4.1.
use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::error;

mod context;
use context::{Context, Stack};

pub type FiberId = u64;

/// Lattice from spec section 3, `Ready -> Running -> {Ready, Term}`,
/// supplemented with `Suspended`: a fiber that yielded while registering
/// an external wake-up (an fd event, a timer) rather than wanting its
/// turn back immediately. The dispatch loop auto-re-enqueues `Ready`
/// fibers but leaves `Suspended` ones alone -- whatever holds the
/// wake-up (`IOManager`, `TimerManager`) is responsible for transitioning
/// them back to `Ready` and scheduling them. Without this distinction a
/// fiber waiting on a socket would be resumed again before the socket was
/// ever ready, since every voluntary yield would look identical to the
/// dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Ready = 0,
    Running = 1,
    Term = 2,
    Suspended = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Term,
            3 => State::Suspended,
            _ => unreachable!("invalid fiber state byte {v}"),
        }
    }
}

struct FiberInner {
    id: FiberId,
    runs_in_scheduler: bool,
    state: AtomicU8,
    ctx: UnsafeCell<Context>,
    // `None` for anchor fibers (thread-main / dispatch), which run on the
    // OS thread's native stack rather than an owned one.
    stack: Option<Stack>,
    callable: UnsafeCell<Option<Box<dyn FnMut() + Send + 'static>>>,
}

// A Fiber and the memory it points to (stack, context) are touched by
// exactly one thread at a time: it is removed from the scheduler's queue
// before being resumed, and control does not return to another owner
// until it yields. Cross-thread *handles* (Arc clones sitting in the
// queue, in an FdContext, or in a thread-local) are inert until resumed.
unsafe impl Send for FiberInner {}
unsafe impl Sync for FiberInner {}

impl fmt::Debug for FiberInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &State::from_u8(self.state.load(Ordering::SeqCst)))
            .field("runs_in_scheduler", &self.runs_in_scheduler)
            .finish()
    }
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::SeqCst);
        if self.stack.is_some() {
            let state = State::from_u8(self.state.load(Ordering::SeqCst));
            debug_assert!(
                matches!(state, State::Term),
                "fiber {} dropped while in state {:?}, programming error",
                self.id,
                state
            );
        }
    }
}

/// A stackful coroutine handle. Cheap to clone (reference-counted); all
/// clones name the same underlying fiber.
#[derive(Clone)]
pub struct Fiber(Arc<FiberInner>);

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static TOTAL_FIBERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Fiber>> = RefCell::new(None);
    static THREAD_MAIN: RefCell<Option<Fiber>> = RefCell::new(None);
    static DISPATCH: RefCell<Option<Fiber>> = RefCell::new(None);
}

impl Fiber {
    /// Construct(callable, stack_size, runs_in_scheduler).
    ///
    /// `stack_size` of `None` resolves `fiber.stack_size` from
    /// [`crate::config`] (default 128 KiB).
    pub fn spawn<F>(callable: F, stack_size: Option<usize>, runs_in_scheduler: bool) -> Fiber
    where
        F: FnMut() + Send + 'static,
    {
        let size = stack_size.unwrap_or_else(crate::config::fiber_stack_size);
        let stack = Stack::new(size).unwrap_or_else(|| {
            error!("fiber: stack allocation of {size} bytes failed, aborting");
            std::process::abort();
        });
        let ctx = Context::make(&stack, trampoline);
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        TOTAL_FIBERS.fetch_add(1, Ordering::SeqCst);
        Fiber(Arc::new(FiberInner {
            id,
            runs_in_scheduler,
            state: AtomicU8::new(State::Ready as u8),
            ctx: UnsafeCell::new(ctx),
            stack: Some(stack),
            callable: UnsafeCell::new(Some(Box::new(callable))),
        }))
    }

    pub fn id(&self) -> FiberId {
        self.0.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.0.state.load(Ordering::SeqCst))
    }

    pub fn runs_in_scheduler(&self) -> bool {
        self.0.runs_in_scheduler
    }

    /// Resume(): precondition `Ready`. Switches the calling thread into
    /// this fiber.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            matches!(state, State::Ready),
            "resume() called on fiber {} in state {:?}, expected Ready",
            self.0.id,
            state
        );
        let peer = if self.0.runs_in_scheduler {
            Fiber::current_dispatch()
        } else {
            Fiber::thread_main()
        };
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        self.0.state.store(State::Running as u8, Ordering::SeqCst);
        unsafe {
            peer.ctx_mut().swap(self.ctx_mut());
        }
    }

    /// Reset(callable): precondition `Term` and an owned stack. Enables
    /// stack reuse.
    pub fn reset<F>(&self, callable: F)
    where
        F: FnMut() + Send + 'static,
    {
        let state = self.state();
        assert!(
            matches!(state, State::Term),
            "reset() called on fiber {} in state {:?}, expected Term",
            self.0.id,
            state
        );
        let stack = self
            .0
            .stack
            .as_ref()
            .expect("reset() called on a fiber with no owned stack");
        unsafe {
            *self.0.callable.get() = Some(Box::new(callable));
            (*self.0.ctx.get()).remake(stack, trampoline);
        }
        self.0.state.store(State::Ready as u8, Ordering::SeqCst);
    }

    /// Yield(): switches the current fiber back to its peer, becoming
    /// `Ready` (the dispatch loop re-enqueues it). Precondition `Running`
    /// or `Term`.
    pub fn yield_now() {
        let cur = Fiber::current();
        do_yield(&cur, State::Ready);
    }

    /// Yields becoming `Suspended` instead of `Ready`: the caller has
    /// already arranged for something else (an [`crate::io_manager`]
    /// waiter, a [`crate::timer`] callback) to transition this fiber back
    /// to `Ready` and reschedule it. The dispatch loop will not
    /// auto-reschedule a fiber that yields this way.
    pub fn yield_suspended() {
        let cur = Fiber::current();
        do_yield(&cur, State::Suspended);
    }

    /// Transitions a `Suspended` fiber back to `Ready` so it may be
    /// resumed again. Called by whatever holds the wake-up that was
    /// registered before the matching [`Fiber::yield_suspended`].
    pub(crate) fn mark_ready(&self) {
        let prev = self.0.state.swap(State::Ready as u8, Ordering::SeqCst);
        debug_assert_eq!(
            State::from_u8(prev),
            State::Suspended,
            "mark_ready() called on fiber {} not in Suspended state",
            self.0.id
        );
    }

    /// The fiber currently running on this thread, synthesizing the
    /// thread-main anchor fiber on first access.
    pub fn current() -> Fiber {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Fiber::new_anchor(State::Running);
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    pub fn current_id() -> FiberId {
        CURRENT.with(|c| c.borrow().as_ref().map(|f| f.0.id).unwrap_or(0))
    }

    pub fn total_fibers() -> u64 {
        TOTAL_FIBERS.load(Ordering::SeqCst)
    }

    pub(crate) fn thread_main() -> Fiber {
        if let Some(f) = THREAD_MAIN.with(|c| c.borrow().clone()) {
            return f;
        }
        // Nothing has run on this thread yet; `current()` populates
        // THREAD_MAIN as a side effect.
        Fiber::current();
        THREAD_MAIN
            .with(|c| c.borrow().clone())
            .expect("thread-main fiber not initialized")
    }

    pub(crate) fn current_dispatch() -> Fiber {
        DISPATCH
            .with(|c| c.borrow().clone())
            .unwrap_or_else(Fiber::thread_main)
    }

    /// Installs `f` as this thread's dispatch fiber -- called once by a
    /// scheduler worker before it starts pulling tasks.
    pub(crate) fn install_dispatch_fiber(f: Fiber) {
        DISPATCH.with(|c| *c.borrow_mut() = Some(f));
    }

    fn new_anchor(initial: State) -> Fiber {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        TOTAL_FIBERS.fetch_add(1, Ordering::SeqCst);
        Fiber(Arc::new(FiberInner {
            id,
            runs_in_scheduler: false,
            state: AtomicU8::new(initial as u8),
            ctx: UnsafeCell::new(Context::capture()),
            stack: None,
            callable: UnsafeCell::new(None),
        }))
    }

    fn ctx_mut(&self) -> &mut Context {
        unsafe { &mut *self.0.ctx.get() }
    }

    fn ptr_eq(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Fiber {}

impl std::hash::Hash for Fiber {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `target` is the state a live (non-`Term`) fiber lands in once control
/// returns to its peer: `Ready` for a plain voluntary yield, `Suspended`
/// when the caller has already arranged its own wake-up.
fn do_yield(fiber: &Fiber, target: State) {
    let state = fiber.state();
    assert!(
        matches!(state, State::Running | State::Term),
        "yield() called on fiber {} in state {:?}",
        fiber.0.id,
        state
    );
    let peer = if fiber.0.runs_in_scheduler {
        Fiber::current_dispatch()
    } else {
        Fiber::thread_main()
    };
    debug_assert!(!peer.ptr_eq(fiber), "fiber yielding into itself");
    CURRENT.with(|c| *c.borrow_mut() = Some(peer.clone()));
    if !matches!(state, State::Term) {
        fiber.0.state.store(target as u8, Ordering::SeqCst);
    }
    unsafe {
        fiber.ctx_mut().swap(peer.ctx_mut());
    }
}

/// Entry point installed via `makecontext`. Retrieves "self" from the
/// thread-local anchor set by `resume()`, runs the user callable guarded
/// against panics, marks the fiber `Term`, and yields. The thread-local's
/// owning reference is dropped *before* the final yield (see spec section
/// 4.1) so that once the scheduler's own reference to this fiber is
/// dropped, the fiber -- including the stack this function is still
/// executing on -- is freed only after control has left it.
extern "C" fn trampoline() {
    let cur = CURRENT
        .with(|c| c.borrow().clone())
        .expect("fiber trampoline entered with no current fiber installed");

    let callable_ptr = cur.0.callable.get();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        if let Some(cb) = unsafe { (*callable_ptr).as_mut() } {
            cb();
        }
    }));
    if let Err(payload) = result {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_owned());
        error!("fiber {} panicked: {msg}", cur.0.id);
    }
    unsafe {
        *cur.0.callable.get() = None;
    }
    cur.0.state.store(State::Term as u8, Ordering::SeqCst);
    CURRENT.with(|c| *c.borrow_mut() = None);
    do_yield(&cur, State::Ready);
    unreachable!("a Term fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn resume_runs_to_completion_and_yields_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let f = Fiber::spawn(
            move || {
                log2.lock().unwrap().push("ran");
            },
            None,
            false,
        );
        assert_eq!(f.state(), State::Ready);
        f.resume();
        assert_eq!(f.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), vec!["ran"]);
    }

    #[test]
    fn explicit_yield_suspends_and_can_be_resumed_again() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let f = Fiber::spawn(
            move || {
                log2.lock().unwrap().push("a");
                Fiber::yield_now();
                log2.lock().unwrap().push("b");
            },
            None,
            false,
        );
        f.resume();
        assert_eq!(f.state(), State::Ready);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        f.resume();
        assert_eq!(f.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn panic_in_callable_is_caught_and_terminates_the_fiber() {
        let f = Fiber::spawn(
            || {
                panic!("boom");
            },
            None,
            false,
        );
        f.resume();
        assert_eq!(f.state(), State::Term);
    }

    #[test]
    fn reset_reuses_the_stack_for_a_new_callable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l1 = log.clone();
        let f = Fiber::spawn(move || l1.lock().unwrap().push(1), None, false);
        f.resume();
        assert_eq!(f.state(), State::Term);

        let l2 = log.clone();
        f.reset(move || l2.lock().unwrap().push(2));
        assert_eq!(f.state(), State::Ready);
        f.resume();
        assert_eq!(f.state(), State::Term);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn total_fibers_counter_returns_to_baseline_after_drop() {
        // Force this thread's thread-main anchor fiber into existence first
        // so it doesn't skew the before/after comparison below.
        let _ = Fiber::current();
        let before = Fiber::total_fibers();
        {
            let fibers: Vec<_> = (0..100)
                .map(|_| Fiber::spawn(|| {}, None, false))
                .collect();
            for f in &fibers {
                f.resume();
            }
            assert_eq!(Fiber::total_fibers(), before + 100);
        }
        assert_eq!(Fiber::total_fibers(), before);
    }
}
