//! M:N task dispatcher: N OS worker threads, each running a *dispatch
//! fiber* that pulls tasks from a shared FIFO and resumes them. See spec
//! section 4.2.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::fiber::{Fiber, State};

/// Logical worker index. `None` in a [`Task`] means "any worker"; `Some`
/// pins the task to that worker only. This stands in for the raw OS
/// thread id the source this crate ports uses -- logical indices are
/// portable and are all the spec's "only consumed by that worker"
/// guarantee actually requires.
pub type WorkerId = usize;

enum TaskKind {
    Fiber(Fiber),
    Callable(Box<dyn FnOnce() + Send + 'static>),
}

/// A unit of work submitted to a [`Scheduler`]: either a fiber handle or a
/// plain callable, optionally pinned to one worker.
pub struct Task {
    kind: TaskKind,
    target: Option<WorkerId>,
}

impl Task {
    pub fn from_fiber(fiber: Fiber) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            target: None,
        }
    }

    pub fn from_fn<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Callable(Box::new(f)),
            target: None,
        }
    }

    /// Pin this task to a specific worker; it is only ever consumed by
    /// that worker's dispatch loop.
    pub fn on_worker(mut self, worker: WorkerId) -> Task {
        self.target = Some(worker);
        self
    }
}

impl From<Fiber> for Task {
    fn from(f: Fiber) -> Task {
        Task::from_fiber(f)
    }
}

fn once_to_mut<F: FnOnce() + Send + 'static>(f: F) -> impl FnMut() + Send + 'static {
    let mut slot = Some(f);
    move || {
        if let Some(f) = slot.take() {
            f();
        }
    }
}

/// The behavior a scheduler's *idle fiber* and `tickle()` delegate to.
/// Base [`Scheduler`] uses [`SpinDriver`]; [`crate::io_manager::IOManager`]
/// provides the epoll-backed override. This is the Rust stand-in for the
/// virtual `idle()`/`tickle()` methods the base/subclass design in the
/// source this crate ports uses.
pub trait Driver: Send + Sync {
    /// One pass of idle work. Called repeatedly (with a yield between
    /// calls) while a worker has no task to run.
    fn idle_once(&self, scheduler: &Scheduler);

    /// Wake one idle worker, if any. No-op for drivers with no concept of
    /// blocking idle (the base spin driver never truly sleeps).
    fn tickle(&self, scheduler: &Scheduler);

    /// Extra quiescence condition a subclass imposes on top of "queue
    /// empty and no active workers" (spec section 4.3: IOManager requires
    /// `pending_events == 0` and no pending timers).
    fn extra_stopping(&self) -> bool {
        true
    }
}

/// The idle behavior is never hidden behind an unreachable default
/// production path the way the ported source's base class spin loop was
/// (see spec section 9, Open Questions): `SpinDriver` is explicit, is
/// what the name says, and a correct program only uses it in tests or for
/// a pure-compute worker pool with no I/O or timers.
pub struct SpinDriver;

impl Driver for SpinDriver {
    fn idle_once(&self, _scheduler: &Scheduler) {}

    fn tickle(&self, _scheduler: &Scheduler) {}
}

struct SchedulerInner {
    name: String,
    thread_count: usize,
    use_caller: bool,
    queue: Mutex<VecDeque<Task>>,
    stopping: AtomicBool,
    started: AtomicBool,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
    driver: Arc<dyn Driver>,
    root_dispatch_fiber: Mutex<Option<Fiber>>,
}

/// Owns N worker threads (optionally including the caller) that multiplex
/// fibers and callables over a shared FIFO. Cheap to clone; all clones
/// name the same scheduler.
#[derive(Clone)]
pub struct Scheduler(Arc<SchedulerInner>);

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Scheduler>> = RefCell::new(None);
    static CURRENT_WORKER: Cell<Option<WorkerId>> = Cell::new(None);
}

impl Scheduler {
    /// Construct(thread_count, use_caller, name) with the base spinning
    /// idle driver.
    pub fn new(thread_count: usize, use_caller: bool, name: impl Into<String>) -> Scheduler {
        Self::with_driver(thread_count, use_caller, name, Arc::new(SpinDriver))
    }

    pub(crate) fn with_driver(
        thread_count: usize,
        use_caller: bool,
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
    ) -> Scheduler {
        assert!(thread_count > 0, "scheduler needs at least one worker");
        let inner = Arc::new(SchedulerInner {
            name: name.into(),
            thread_count,
            use_caller,
            queue: Mutex::new(VecDeque::new()),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            driver,
            root_dispatch_fiber: Mutex::new(None),
        });
        let scheduler = Scheduler(inner);
        if use_caller {
            // The dispatch fiber for the caller's logical worker (id 0)
            // is built now, so `schedule()` is usable before `start()`,
            // but it is not resumed until `stop()`: the caller thread is
            // busy running the rest of the program until then.
            let dispatch = spawn_dispatch_fiber(scheduler.clone(), 0);
            *scheduler.0.root_dispatch_fiber.lock().unwrap() = Some(dispatch);
        }
        scheduler
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Start(): spawns `thread_count - (use_caller ? 1 : 0)` workers.
    /// Idempotent.
    pub fn start(&self) {
        if self.0.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let spawn_count = self.0.thread_count - usize::from(self.0.use_caller);
        let mut handles = Vec::with_capacity(spawn_count);
        for i in 0..spawn_count {
            let worker_id = if self.0.use_caller { i + 1 } else { i };
            let scheduler = self.clone();
            let thread_name = format!("{}-{}", self.0.name, worker_id);
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let dispatch = spawn_dispatch_fiber(scheduler, worker_id);
                    dispatch.resume();
                })
                .expect("failed to spawn scheduler worker thread");
            handles.push(handle);
        }
        *self.0.threads.lock().unwrap() = handles;
    }

    /// Schedule(task, target = any). Returns whether a tickle was issued
    /// (i.e. the queue was observed empty before this task landed). Errs
    /// with `AlreadyStopped` once [`Scheduler::stop`] has been called --
    /// nothing will ever drain the queue past that point.
    pub fn schedule(&self, task: impl Into<Task>) -> Result<bool> {
        self.schedule_batch(std::iter::once(task.into()))
    }

    pub fn schedule_fn<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::from_fn(f))
    }

    /// Batch variant: holds the queue lock once for the whole batch.
    pub fn schedule_batch<I>(&self, tasks: I) -> Result<bool>
    where
        I: IntoIterator<Item = Task>,
    {
        if self.0.stopping.load(Ordering::SeqCst) {
            return Err(Error::AlreadyStopped);
        }
        let was_empty = {
            let mut q = self.0.queue.lock().unwrap();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty
        };
        if was_empty {
            self.0.driver.tickle(self);
        }
        Ok(was_empty)
    }

    /// Stop(): sets the stopping flag, tickles every worker, runs the
    /// caller's own dispatch loop to quiescence (use_caller mode), then
    /// joins every spawned thread. Not restartable afterwards.
    pub fn stop(&self) {
        self.0.stopping.store(true, Ordering::SeqCst);
        for _ in 0..self.0.thread_count {
            self.0.driver.tickle(self);
        }
        if self.0.use_caller {
            if let Some(dispatch) = self.0.root_dispatch_fiber.lock().unwrap().take() {
                dispatch.resume();
            }
        }
        let handles = std::mem::take(&mut *self.0.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.0.stopping.load(Ordering::SeqCst)
    }

    pub fn active_threads(&self) -> usize {
        self.0.active_threads.load(Ordering::SeqCst)
    }

    pub fn idle_threads(&self) -> usize {
        self.0.idle_threads.load(Ordering::SeqCst)
    }

    pub fn has_idle_threads(&self) -> bool {
        self.idle_threads() > 0
    }

    pub fn pending_task_count(&self) -> usize {
        self.0.queue.lock().unwrap().len()
    }

    /// Quiescent iff the queue is empty, no worker is executing a task,
    /// and the driver's extra condition (no pending epoll events / timers
    /// for [`crate::io_manager::IOManager`]) holds. Spec section 3.
    pub fn stopping(&self) -> bool {
        self.0.stopping.load(Ordering::SeqCst)
            && self.0.queue.lock().unwrap().is_empty()
            && self.0.active_threads.load(Ordering::SeqCst) == 0
            && self.0.driver.extra_stopping()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn Driver> {
        &self.0.driver
    }

    pub fn current() -> Option<Scheduler> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    pub fn current_worker_id() -> Option<WorkerId> {
        CURRENT_WORKER.with(|c| c.get())
    }

    pub fn current_dispatch_fiber() -> Fiber {
        Fiber::current_dispatch()
    }

    fn pop_task(&self, worker_id: WorkerId) -> Option<Task> {
        let mut queue = self.0.queue.lock().unwrap();
        if let Some(idx) = queue
            .iter()
            .position(|t| t.target.map_or(true, |w| w == worker_id))
        {
            return queue.remove(idx);
        }
        let has_unreachable_work = !queue.is_empty();
        drop(queue);
        if has_unreachable_work {
            // Every queued task is pinned to a different worker; tickle so
            // its owner notices if it's currently idling.
            self.0.driver.tickle(self);
        }
        None
    }

    fn execute(&self, task: Task) {
        self.0.active_threads.fetch_add(1, Ordering::SeqCst);
        let resumed = match task.kind {
            TaskKind::Fiber(f) => f,
            TaskKind::Callable(cb) => Fiber::spawn(once_to_mut(cb), None, true),
        };
        resumed.resume();
        match resumed.state() {
            State::Ready => {
                // Ignoring `AlreadyStopped` here is deliberate: it can only
                // race with a `stop()` called concurrently from another
                // thread, in which case this fiber's remaining work is
                // abandoned along with everything else still in flight.
                let _ = self.schedule(Task::from_fiber(resumed));
            }
            // Suspended: the fiber already arranged its own wake-up (an
            // IOManager waiter, a timer) before yielding; dropping this
            // reference here is fine, that side holds its own.
            State::Suspended | State::Term => {}
            State::Running => unreachable!("fiber left RUNNING after resume() returned"),
        }
        self.0.active_threads.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.0.name)
            .field("thread_count", &self.0.thread_count)
            .field("active_threads", &self.active_threads())
            .field("idle_threads", &self.idle_threads())
            .finish()
    }
}

fn spawn_idle_fiber(scheduler: Scheduler) -> Fiber {
    Fiber::spawn(
        move || loop {
            if scheduler.stopping() {
                break;
            }
            scheduler.0.driver.clone().idle_once(&scheduler);
            Fiber::yield_now();
        },
        None,
        true,
    )
}

fn spawn_dispatch_fiber(scheduler: Scheduler, worker_id: WorkerId) -> Fiber {
    let idle_fiber = spawn_idle_fiber(scheduler.clone());
    Fiber::spawn(
        move || dispatch_loop(scheduler.clone(), worker_id, idle_fiber.clone()),
        None,
        false,
    )
}

/// The dispatch loop proper: seek -> execute -> seek, or seek -> idle ->
/// seek when the queue has nothing for this worker. Spec section 4.2.
fn dispatch_loop(scheduler: Scheduler, worker_id: WorkerId, idle_fiber: Fiber) {
    CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(scheduler.clone()));
    CURRENT_WORKER.with(|c| c.set(Some(worker_id)));
    Fiber::install_dispatch_fiber(Fiber::current());
    debug!(
        "scheduler '{}' worker {} entering dispatch loop",
        scheduler.name(),
        worker_id
    );

    loop {
        if scheduler.stopping() {
            break;
        }
        match scheduler.pop_task(worker_id) {
            Some(task) => scheduler.execute(task),
            None => {
                scheduler.0.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                scheduler.0.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    trace!(
        "scheduler '{}' worker {} leaving dispatch loop",
        scheduler.name(),
        worker_id
    );
}
