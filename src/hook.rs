//! Fiber-friendly socket and sleep wrappers.
//!
//! Grounded on the cooperative-I/O facade in the system this crate's core
//! is ported from: a plain wrapper type that retries a non-blocking
//! syscall after yielding on [`crate::io_manager::Event`] readiness,
//! rather than monkey-patching `read`/`write`/`connect` globally. Callers
//! opt in by using these types instead of `std::net`'s directly.
use std::io::{self, Read, Write};
use std::net::{self, SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::io_manager::{Event, IOManager};
use crate::timer::TimerManager;

/// Wraps a non-blocking TCP stream; reads and writes yield the calling
/// fiber instead of blocking the OS thread on `EWOULDBLOCK`.
pub struct TcpStream {
    inner: net::TcpStream,
    io: Arc<IOManager>,
}

impl TcpStream {
    pub fn connect<A: ToSocketAddrs>(io: &Arc<IOManager>, addr: A) -> io::Result<TcpStream> {
        let inner = net::TcpStream::connect(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpStream {
            inner,
            io: io.clone(),
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn wait(&self, event: Event) -> io::Result<()> {
        self.io
            .add_event_and_yield(self.inner.as_raw_fd(), event)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(Event::READ)?,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(Event::WRITE)?,
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// Wraps a non-blocking TCP listener; `accept` yields instead of blocking
/// while no connection is pending.
pub struct TcpListener {
    inner: net::TcpListener,
    io: Arc<IOManager>,
}

impl TcpListener {
    pub fn bind<A: ToSocketAddrs>(io: &Arc<IOManager>, addr: A) -> io::Result<TcpListener> {
        let inner = net::TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(TcpListener {
            inner,
            io: io.clone(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accepts a connection, cooperatively yielding the calling fiber
    /// while none is pending. Spec scenario S3, "TCP accept loop".
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            match self.inner.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(true)?;
                    return Ok((
                        TcpStream {
                            inner: stream,
                            io: self.io.clone(),
                        },
                        addr,
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.io
                        .add_event_and_yield(self.inner.as_raw_fd(), Event::READ)
                        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Suspends the calling fiber for `period_ms`, without blocking its
/// worker thread. Built on the same [`TimerManager`] the I/O driver uses
/// for its own deadlines.
pub fn sleep_ms(timers: &TimerManager, period_ms: u64) {
    let fiber = Fiber::current();
    let _timer = timers.add_timer(period_ms, move || {
        fiber.mark_ready();
        if let Some(scheduler) = crate::scheduler::Scheduler::current() {
            let _ = scheduler.schedule(crate::scheduler::Task::from_fiber(fiber.clone()));
        }
    });
    Fiber::yield_suspended();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn s6_accept_loop_serves_one_connection() {
        let (scheduler, io) = IOManager::new(1, true, "hook-s6");
        let listener = TcpListener::bind(&io, "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let r = received.clone();
        scheduler.schedule_fn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            r.lock().unwrap().extend_from_slice(&buf);
        }).unwrap();

        scheduler.start();
        std::thread::sleep(Duration::from_millis(20));
        let mut client = net::TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        scheduler.stop();

        assert_eq!(&received.lock().unwrap()[..], b"ping");
    }

    #[test]
    fn sleep_ms_yields_and_resumes_on_timer() {
        let (scheduler, io) = IOManager::new(1, true, "hook-sleep");
        let done = Arc::new(Mutex::new(false));
        let d = done.clone();
        scheduler.schedule_fn(move || {
            sleep_ms(io.timers(), 10);
            *d.lock().unwrap() = true;
        }).unwrap();
        scheduler.start();
        scheduler.stop();
        assert!(*done.lock().unwrap());
    }
}
