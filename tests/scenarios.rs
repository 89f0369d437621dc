//! End-to-end scenarios exercising the fused runtime as a whole, rather
//! than one subsystem's internals. Mirrors the scenarios unit-tested
//! alongside each subsystem (`scheduler.rs`, `io_manager.rs`, `timer.rs`,
//! `hook.rs`), but drives them purely through the crate's public API.

use std::io::{Read, Write};
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use pretty_assertions::assert_eq;

use fiberflow::{current_fiber_id, Event, Fiber, IOManager, Scheduler, TcpListener};

static INIT_LOGGING: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

fn init() {
    Lazy::force(&INIT_LOGGING);
}

#[test]
fn minimal_fiber_runs_once_and_scheduler_quiesces() {
    init();
    let before = Fiber::total_fibers();
    let scheduler = Scheduler::new(1, true, "e2e-minimal");
    let buf = Arc::new(Mutex::new(String::new()));
    let b = buf.clone();
    scheduler.schedule_fn(move || {
        b.lock().unwrap().push('A');
    }).unwrap();
    scheduler.start();
    scheduler.stop();

    assert_eq!(*buf.lock().unwrap(), "A");
    assert!(scheduler.stopping());
    assert_eq!(Fiber::total_fibers(), before);
}

#[test]
fn tcp_accept_loop_wakes_on_remote_connect() {
    let (scheduler, io) = IOManager::new(2, false, "e2e-accept");
    let listener = TcpListener::bind(&io, "127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let result = Arc::new(Mutex::new(String::new()));
    let r = result.clone();
    scheduler.schedule_fn(move || {
        let (mut stream, _peer) = listener.accept().unwrap();
        let mut byte = [0u8; 1];
        if stream.read(&mut byte).unwrap() == 1 {
            r.lock().unwrap().push(byte[0] as char);
        }
    }).unwrap();
    scheduler.start();

    std::thread::sleep(Duration::from_millis(20));
    let mut client = StdTcpStream::connect(addr).unwrap();
    client.write_all(b"C").unwrap();

    std::thread::sleep(Duration::from_millis(50));
    scheduler.stop();

    assert_eq!(*result.lock().unwrap(), "C");
}

#[test]
fn timer_cancelled_before_firing_never_runs() {
    let (scheduler, io) = IOManager::new(1, true, "e2e-timer-cancel");
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let timer = io.add_timer(50, move || {
        f.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.start();
    std::thread::sleep(Duration::from_millis(20));
    timer.cancel();
    std::thread::sleep(Duration::from_millis(200));
    scheduler.stop();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn recurring_condition_timer_stops_after_condition_drops() {
    let (scheduler, io) = IOManager::new(1, true, "e2e-recurring");
    let guard = Arc::new(());
    let weak = Arc::downgrade(&guard);
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let _timer = io
        .timers()
        .add_condition_timer(10, weak, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

    scheduler.start();
    std::thread::sleep(Duration::from_millis(95));
    drop(guard);
    std::thread::sleep(Duration::from_millis(105));
    scheduler.stop();

    let fired = count.load(Ordering::SeqCst);
    assert!((8..=11).contains(&fired), "fired {fired} times");
}

#[test]
fn schedule_from_outside_thread_wakes_an_idling_worker() {
    let (scheduler, io) = IOManager::new(2, false, "e2e-tickle");
    scheduler.start();
    // Give both workers a chance to settle into epoll_wait.
    std::thread::sleep(Duration::from_millis(20));

    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    assert!(scheduler
        .schedule_fn(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap());

    std::thread::sleep(Duration::from_millis(20));
    scheduler.stop();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    drop(io);
}

#[test]
fn duplicate_registration_on_same_fd_event_is_rejected() {
    let (scheduler, io) = IOManager::new(1, true, "e2e-dup");
    let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
    use std::os::unix::io::AsRawFd;
    a.set_nonblocking(true).unwrap();
    let fd = a.as_raw_fd();

    let cancelled_fired = Arc::new(AtomicUsize::new(0));
    let cf = cancelled_fired.clone();
    io.add_event_with_callback(fd, Event::READ, move || {
        cf.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    let err = io
        .add_event_with_callback(fd, Event::READ, || {})
        .unwrap_err();
    assert_eq!(err.code(), fiberflow::ErrorCode::DuplicateEvent);

    io.cancel_all(fd, &scheduler).unwrap();
    scheduler.start();
    scheduler.stop();

    assert_eq!(cancelled_fired.load(Ordering::SeqCst), 1);
}

#[test]
fn current_fiber_id_is_stable_within_one_fiber_and_varies_across() {
    let scheduler = Scheduler::new(1, true, "e2e-ids");
    let ids = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..3 {
        let ids = ids.clone();
        scheduler.schedule_fn(move || {
            let first = current_fiber_id();
            let second = current_fiber_id();
            assert_eq!(first, second);
            ids.lock().unwrap().push(first);
        }).unwrap();
    }
    scheduler.start();
    scheduler.stop();

    let ids = ids.lock().unwrap();
    assert_eq!(ids.len(), 3);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
}
