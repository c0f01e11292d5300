//! Single-threaded, level-triggered readiness loop bridging fd events to
//! task wake-ups.

use crate::io::Ready;
use anyhow::{Context as _, Result};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

/// One-shot continuation invoked on the reactor thread when an fd becomes
/// ready. It re-arms the suspended task and feeds it back to the scheduler.
pub(crate) type ReadyCallback = Box<dyn FnOnce() + Send>;

const MAX_EVENTS: usize = 64;

/// Registration state, shared between the reactor thread (event dispatch)
/// and worker threads (suspension registration).
struct Waiters {
    /// Fds handed to the kernel poller; superset of the callback-map keys.
    fds: HashSet<RawFd>,

    /// Pending read-ready callbacks, at most one per fd.
    read: HashMap<RawFd, ReadyCallback>,

    /// Pending write-ready callbacks, at most one per fd.
    write: HashMap<RawFd, ReadyCallback>,
}

/// The I/O reactor. One per runtime, driven by a dedicated thread running
/// [`Reactor::run`]; everything else only registers interest.
pub struct Reactor {
    epoll: Epoll,

    waiters: Mutex<Waiters>,

    running: AtomicBool,

    /// Kernel wait timeout; also bounds how long `stop` takes to be seen.
    timeout: EpollTimeout,

    /// Number of callback registrations that actually reached the maps;
    /// the fast-path probe must keep this at zero.
    #[cfg(test)]
    registrations: AtomicUsize,
}

impl Reactor {
    pub(crate) fn try_new(poll_interval: Duration) -> Result<Reactor> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("failed to create the kernel poller")?;

        let millis = poll_interval.as_millis().min(u16::MAX as u128) as u16;

        Ok(Reactor {
            epoll,
            waiters: Mutex::new(Waiters {
                fds: HashSet::new(),
                read: HashMap::new(),
                write: HashMap::new(),
            }),
            running: AtomicBool::new(true),
            timeout: EpollTimeout::from(millis),
            #[cfg(test)]
            registrations: AtomicUsize::new(0),
        })
    }

    pub(crate) fn into_handle(self) -> Handle {
        Handle(Arc::new(self))
    }

    /// Register `fd` with the poller, level-triggered for both read and
    /// write interest. Idempotent; failures are logged and leave the fd
    /// unregistered (awaits on it will never wake).
    pub fn register_fd(&self, fd: RawFd) {
        let mut waiters = self.waiters.lock();
        if !waiters.fds.insert(fd) {
            tracing::debug!(fd, "fd already registered");
            return;
        }

        let event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT, fd as u64);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(errno) = self.epoll.add(borrowed, event) {
            tracing::warn!(fd, %errno, "failed to add fd to the poller");
            waiters.fds.remove(&fd);
        }
    }

    /// Remove `fd` from the poller. Callers must unregister before closing
    /// the fd. Pending callbacks for the fd are discarded, keeping the fd
    /// set a superset of the callback maps.
    pub fn unregister_fd(&self, fd: RawFd) {
        let mut waiters = self.waiters.lock();
        if !waiters.fds.remove(&fd) {
            tracing::debug!(fd, "fd was not registered");
            return;
        }

        if waiters.read.remove(&fd).is_some() | waiters.write.remove(&fd).is_some() {
            tracing::warn!(fd, "discarding pending waiters of an unregistered fd");
        }

        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(errno) = self.epoll.delete(borrowed) {
            tracing::warn!(fd, %errno, "failed to remove fd from the poller");
        }
    }

    /// Arm a one-shot read-ready callback for `fd`.
    ///
    /// One waiter per (fd, direction): a second registration is dropped
    /// with a warning and will never fire.
    pub(crate) fn register_read_callback(&self, fd: RawFd, callback: ReadyCallback) {
        let mut waiters = self.waiters.lock();
        if !waiters.fds.contains(&fd) {
            tracing::warn!(fd, "read waiter on an unregistered fd dropped");
            return;
        }
        if waiters.read.contains_key(&fd) {
            tracing::warn!(fd, "fd already has a read waiter; dropping the new one");
            return;
        }

        #[cfg(test)]
        self.registrations.fetch_add(1, Ordering::Relaxed);

        waiters.read.insert(fd, callback);
    }

    /// Arm a one-shot write-ready callback for `fd`. Same contract as
    /// [`Reactor::register_read_callback`].
    pub(crate) fn register_write_callback(&self, fd: RawFd, callback: ReadyCallback) {
        let mut waiters = self.waiters.lock();
        if !waiters.fds.contains(&fd) {
            tracing::warn!(fd, "write waiter on an unregistered fd dropped");
            return;
        }
        if waiters.write.contains_key(&fd) {
            tracing::warn!(fd, "fd already has a write waiter; dropping the new one");
            return;
        }

        #[cfg(test)]
        self.registrations.fetch_add(1, Ordering::Relaxed);

        waiters.write.insert(fd, callback);
    }

    /// The event loop. Waits with a timeout so the `running` flag is
    /// re-checked at least once per interval; a wait failure other than
    /// `EINTR` is fatal and terminates the reactor (suspended tasks are
    /// lost).
    pub(crate) fn run(&self) {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        tracing::debug!("reactor started");

        while self.running.load(Ordering::Acquire) {
            let n = match self.epoll.wait(&mut events, self.timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    tracing::error!(%errno, "poller wait failed; reactor terminating");
                    break;
                }
            };

            for event in &events[..n] {
                let fd = event.data() as RawFd;
                let ready = Ready::from_epoll(event.events());

                // Remove-before-invoke keeps callbacks one-shot even while
                // the fd stays level-ready.
                if ready.contains(Ready::READABLE) {
                    let callback = self.waiters.lock().read.remove(&fd);
                    if let Some(callback) = callback {
                        callback();
                    }
                }

                if ready.contains(Ready::WRITABLE) {
                    let callback = self.waiters.lock().write.remove(&fd);
                    if let Some(callback) = callback {
                        callback();
                    }
                }
            }
        }

        tracing::debug!("reactor stopped");
    }

    /// Ask the loop to exit; observed within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn registration_count(&self) -> usize {
        self.registrations.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let waiters = self.waiters.lock();
        f.debug_struct("Reactor")
            .field("fds", &waiters.fds.len())
            .field("read_waiters", &waiters.read.len())
            .field("write_waiters", &waiters.write.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Cloneable handle to the runtime's reactor.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Reactor>);

#[doc(hidden)]
impl Deref for Handle {
    type Target = Arc<Reactor>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Reactor: Send, Sync);
    assert_impl_all!(Handle: Send, Sync, Clone);

    const INTERVAL: Duration = Duration::from_millis(10);

    fn counting_callback(hits: &Arc<AtomicUsize>) -> ReadyCallback {
        let hits = Arc::clone(hits);
        Box::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn start_reactor() -> (Handle, thread::JoinHandle<()>) {
        let handle = Reactor::try_new(INTERVAL).expect("reactor").into_handle();
        let runner = handle.clone();
        let thread = thread::spawn(move || runner.run());
        (handle, thread)
    }

    fn wait_for(hits: &Arc<AtomicUsize>, expected: usize) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if hits.load(Ordering::SeqCst) == expected {
                return true;
            }
            thread::yield_now();
        }
        false
    }

    #[test]
    fn test_read_callback_is_one_shot() {
        let (reactor, thread) = start_reactor();
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        reactor.register_fd(rx.as_raw_fd());

        let hits = Arc::new(AtomicUsize::new(0));
        reactor.register_read_callback(rx.as_raw_fd(), counting_callback(&hits));

        nix::unistd::write(&tx, b"x").expect("write");
        assert!(wait_for(&hits, 1), "callback did not fire");

        // The fd stays level-readable and receives more data, but the
        // consumed registration must not fire again.
        nix::unistd::write(&tx, b"y").expect("write");
        thread::sleep(INTERVAL * 4);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A fresh registration fires for the still-buffered data.
        reactor.register_read_callback(rx.as_raw_fd(), counting_callback(&hits));
        assert!(wait_for(&hits, 2), "re-registered callback did not fire");

        reactor.unregister_fd(rx.as_raw_fd());
        reactor.stop();
        thread.join().expect("reactor thread");
    }

    #[test]
    fn test_second_waiter_is_dropped() {
        let (reactor, thread) = start_reactor();
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        reactor.register_fd(rx.as_raw_fd());

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        reactor.register_read_callback(rx.as_raw_fd(), counting_callback(&first));
        reactor.register_read_callback(rx.as_raw_fd(), counting_callback(&second));

        nix::unistd::write(&tx, b"x").expect("write");
        assert!(wait_for(&first, 1), "surviving waiter did not fire");
        assert_eq!(second.load(Ordering::SeqCst), 0);

        reactor.stop();
        thread.join().expect("reactor thread");
    }

    #[test]
    fn test_register_fd_is_idempotent() {
        let (reactor, thread) = start_reactor();
        let (rx, _tx) = nix::unistd::pipe().expect("pipe");

        reactor.register_fd(rx.as_raw_fd());
        reactor.register_fd(rx.as_raw_fd());
        reactor.unregister_fd(rx.as_raw_fd());
        // Second unregister is a no-op, not an error.
        reactor.unregister_fd(rx.as_raw_fd());

        reactor.stop();
        thread.join().expect("reactor thread");
    }

    #[test]
    fn test_stop_joins_within_interval() {
        let (reactor, thread) = start_reactor();
        let started = std::time::Instant::now();
        reactor.stop();
        thread.join().expect("reactor thread");
        assert!(started.elapsed() < INTERVAL * 10);
    }
}
