//! Leaf awaitables bridging fd readiness to the scheduler.

use crate::context;
use crate::reactor::{self, ReadyCallback};
use crate::task::TaskState;
use bitflags::bitflags;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::epoll::EpollFlags;
use std::future::Future;
use std::os::fd::{BorrowedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};

bitflags! {
    /// Readiness of a file descriptor, as reported by the poller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Ready: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
    }
}

impl Ready {
    /// Map a level-triggered epoll event to readiness. Errors and hangups
    /// wake both directions so the following syscall can surface them.
    pub(crate) fn from_epoll(flags: EpollFlags) -> Ready {
        let closed = EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP;
        let mut ready = Ready::empty();

        if flags.intersects(EpollFlags::EPOLLIN | closed) {
            ready |= Ready::READABLE;
        }
        if flags.intersects(EpollFlags::EPOLLOUT | closed) {
            ready |= Ready::WRITABLE;
        }

        ready
    }
}

/// One direction of fd readiness a task can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Owned description of an I/O suspension: "wake this task when `fd` is
/// ready in `direction`". Cheap to copy, so the scheduler keeps its own
/// while the frame keeps none.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoWaitable {
    fd: RawFd,
    direction: Direction,
}

impl IoWaitable {
    pub(crate) fn new(fd: RawFd, direction: Direction) -> IoWaitable {
        IoWaitable { fd, direction }
    }

    /// Zero-timeout probe: is the fd ready right now, without a reactor
    /// round-trip? Any revent (including error conditions) counts as ready
    /// and lets the following syscall report the problem.
    pub(crate) fn ready_now(&self) -> bool {
        let flags = match self.direction {
            Direction::Read => PollFlags::POLLIN,
            Direction::Write => PollFlags::POLLOUT,
        };
        let borrowed = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let mut fds = [PollFd::new(borrowed, flags)];

        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(n) => n > 0,
            Err(errno) => {
                tracing::warn!(fd = self.fd, %errno, "readiness probe failed");
                false
            }
        }
    }

    /// Hand a one-shot wake-up for this suspension to the reactor.
    pub(crate) fn register(self, reactor: &reactor::Handle, wake: ReadyCallback) {
        match self.direction {
            Direction::Read => reactor.register_read_callback(self.fd, wake),
            Direction::Write => reactor.register_write_callback(self.fd, wake),
        }
    }
}

/// Suspend the current task until `fd` is readable.
///
/// If the fd is readable right now the suspension is skipped entirely.
/// Readiness is level-triggered and advisory: the syscall issued after
/// resumption may still return `EAGAIN` in edge cases, and callers treat
/// that as a short read rather than retrying here.
///
/// The fd must have been registered with the reactor (see
/// [`Reactor::register_fd`]) before the first await that actually
/// suspends, or the task will never be woken.
///
/// [`Reactor::register_fd`]: crate::reactor::Reactor::register_fd
pub fn wait_for_read(fd: RawFd) -> WaitForRead {
    WaitForRead {
        fd,
        suspended: false,
    }
}

/// Suspend the current task until `fd` is writable.
///
/// See [`wait_for_read`] for the registration requirement and the
/// level-triggered caveats.
pub fn wait_for_write(fd: RawFd) -> WaitForWrite {
    WaitForWrite {
        fd,
        suspended: false,
    }
}

/// Future returned by [`wait_for_read`].
#[derive(Debug)]
pub struct WaitForRead {
    fd: RawFd,
    suspended: bool,
}

impl Future for WaitForRead {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.suspended {
            // The reactor observed readiness and re-armed the task.
            return Poll::Ready(());
        }

        let waitable = IoWaitable::new(this.fd, Direction::Read);
        if waitable.ready_now() {
            return Poll::Ready(());
        }

        this.suspended = true;
        suspend_on(waitable);
        Poll::Pending
    }
}

/// Future returned by [`wait_for_write`].
#[derive(Debug)]
pub struct WaitForWrite {
    fd: RawFd,
    suspended: bool,
}

impl Future for WaitForWrite {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.suspended {
            return Poll::Ready(());
        }

        let waitable = IoWaitable::new(this.fd, Direction::Write);
        if waitable.ready_now() {
            return Poll::Ready(());
        }

        this.suspended = true;
        suspend_on(waitable);
        Poll::Pending
    }
}

/// Record the suspension on the running task; the scheduler hands the
/// waitable to the reactor after the poll returns.
fn suspend_on(waitable: IoWaitable) {
    context::with_current_task(|task| {
        task.header().set_state(TaskState::BlockedOnIo);
        unsafe {
            task.trailer().set_io_waitable(waitable);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_from_epoll_maps_directions() {
        assert_eq!(
            Ready::from_epoll(EpollFlags::EPOLLIN),
            Ready::READABLE
        );
        assert_eq!(
            Ready::from_epoll(EpollFlags::EPOLLOUT),
            Ready::WRITABLE
        );
        assert_eq!(
            Ready::from_epoll(EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT),
            Ready::READABLE | Ready::WRITABLE
        );
        assert_eq!(Ready::from_epoll(EpollFlags::empty()), Ready::empty());
    }

    #[test]
    fn test_ready_from_epoll_errors_wake_both() {
        for flags in [EpollFlags::EPOLLERR, EpollFlags::EPOLLHUP] {
            assert_eq!(Ready::from_epoll(flags), Ready::READABLE | Ready::WRITABLE);
        }
    }

    #[test]
    fn test_ready_now_on_pipe() {
        let (rx, tx) = nix::unistd::pipe().expect("pipe");
        use std::os::fd::AsRawFd;

        // Empty pipe: not readable, but writable.
        assert!(!IoWaitable::new(rx.as_raw_fd(), Direction::Read).ready_now());
        assert!(IoWaitable::new(tx.as_raw_fd(), Direction::Write).ready_now());

        nix::unistd::write(&tx, b"x").expect("write");
        assert!(IoWaitable::new(rx.as_raw_fd(), Direction::Read).ready_now());
    }
}
