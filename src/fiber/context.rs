//! Raw machine-context switching.
//!
//! Built directly on the `ucontext.h` primitives (`getcontext`,
//! `makecontext`, `swapcontext`) the way the C++ system this crate's core
//! is ported from uses them -- no third-party stack-switching crate is
//! introduced, since `libc` (already a dependency for the epoll and clock
//! calls elsewhere in this crate) exposes the same syscalls the reference
//! implementation calls directly.
use std::ptr;

use log::error;

/// Page size used to round stack sizes and size the guard page. Read once;
/// `sysconf` never changes within a process.
fn page_size() -> usize {
    static PAGE_SIZE: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(std::sync::atomic::Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let size = if size == 0 { 4096 } else { size };
    PAGE_SIZE.store(size, std::sync::atomic::Ordering::Relaxed);
    size
}

fn round_up_to_page(len: usize, page: usize) -> usize {
    (len + page - 1) / page * page
}

/// Owned fiber stack, `mmap`-backed with one unreadable/unwritable guard
/// page beneath it.
///
/// The stack itself grows down from `base + guard_len + len`; a `malloc`'d
/// buffer (what the reference fiber implementation's `MallocStackAllocator`
/// uses) has no such boundary, so an overflow silently corrupts whatever
/// heap allocation happens to sit below it. A guard page turns that into an
/// immediate `SIGSEGV` instead -- this crate does not install a handler for
/// it (doing so correctly needs an async-signal-safe log call on an
/// alternate signal stack, more moving parts than this crate's scope calls
/// for), so the fatal abort spec section 4.1 asks for is the process's
/// default disposition rather than a handled, logged one.
pub(crate) struct Stack {
    base: *mut u8,
    guard_len: usize,
    len: usize,
}

impl Stack {
    pub(crate) fn new(len: usize) -> Option<Self> {
        let page = page_size();
        let len = round_up_to_page(len.max(page), page);
        let guard_len = page;
        let total = guard_len + len;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }
        let base = base as *mut u8;
        if unsafe { libc::mprotect(base as *mut libc::c_void, guard_len, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(base as *mut libc::c_void, total) };
            return None;
        }
        Some(Stack {
            base,
            guard_len,
            len,
        })
    }

    pub(crate) fn base_and_len(&self) -> (*mut libc::c_void, usize) {
        let usable = unsafe { self.base.add(self.guard_len) };
        (usable as *mut libc::c_void, self.len)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.guard_len + self.len) };
    }
}

// Stacks are mmap'd regions with no thread affinity; the invariant that
// only one thread ever touches a given fiber's stack at a time is upheld
// by the scheduler (a fiber is dequeued before being resumed).
unsafe impl Send for Stack {}

/// A saved CPU context: register file plus the stack pointer.
pub(crate) struct Context(libc::ucontext_t);

impl Context {
    /// An empty context, to be filled in by [`Context::capture`] or
    /// [`Context::make`].
    pub(crate) fn uninit() -> Self {
        Context(unsafe { std::mem::zeroed() })
    }

    /// Captures the calling context in place, mirroring `getcontext`.
    /// Used to set up the thread-main and dispatch fibers, which run on
    /// the native stack rather than an owned one.
    pub(crate) fn capture() -> Self {
        let mut ctx = Self::uninit();
        if unsafe { libc::getcontext(&mut ctx.0) } != 0 {
            fatal("getcontext");
        }
        ctx
    }

    /// Prepares a context that, when switched into, begins executing
    /// `entry` on `stack`.
    pub(crate) fn make(stack: &Stack, entry: extern "C" fn()) -> Self {
        let mut ctx = Self::uninit();
        if unsafe { libc::getcontext(&mut ctx.0) } != 0 {
            fatal("getcontext");
        }
        let (base, len) = stack.base_and_len();
        ctx.0.uc_link = ptr::null_mut();
        ctx.0.uc_stack.ss_sp = base;
        ctx.0.uc_stack.ss_size = len;
        unsafe { libc::makecontext(&mut ctx.0, std::mem::transmute(entry), 0) };
        ctx
    }

    /// Re-initializes an already-terminated context with a fresh entry
    /// point and the same stack, enabling stack reuse (`Fiber::reset`).
    pub(crate) fn remake(&mut self, stack: &Stack, entry: extern "C" fn()) {
        if unsafe { libc::getcontext(&mut self.0) } != 0 {
            fatal("getcontext");
        }
        let (base, len) = stack.base_and_len();
        self.0.uc_link = ptr::null_mut();
        self.0.uc_stack.ss_sp = base;
        self.0.uc_stack.ss_size = len;
        unsafe { libc::makecontext(&mut self.0, std::mem::transmute(entry), 0) };
    }

    /// Switches from `self` into `target`. Control returns to the call
    /// site once some other context switches back into `self`.
    ///
    /// # Safety
    /// Both contexts must remain valid (their stacks not freed) for the
    /// duration of the switch, and this must be called on the thread that
    /// owns `self`.
    pub(crate) unsafe fn swap(&mut self, target: &mut Context) {
        if libc::swapcontext(&mut self.0, &mut target.0) != 0 {
            fatal("swapcontext");
        }
    }
}

/// A failed context switch is unrecoverable: the process aborts, per the
/// fatal-failure semantics in spec section 4.4.
fn fatal(op: &str) -> ! {
    error!("fiber: {op} failed, aborting");
    std::process::abort();
}
