//! Non-blocking TCP sockets driven by the reactor.

use crate::context;
use crate::io::{wait_for_read, wait_for_write};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, sockopt,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd, RawFd};

const LISTEN_BACKLOG: i32 = 10;

/// A non-blocking socket with coroutine-style blocking semantics: each
/// operation awaits readiness, then issues the syscall once.
///
/// The fd is made non-blocking and registered with the reactor at
/// construction, and unregistered and closed on drop. Sockets are
/// move-only; moving transfers the fd.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Wrap an existing descriptor: set it non-blocking and register it
    /// with the reactor. A negative fd yields an invalid socket, detected
    /// via [`Socket::is_valid`].
    ///
    /// Must be called from within the runtime.
    pub fn from_fd(fd: RawFd) -> Socket {
        if fd >= 0 {
            if let Err(errno) = set_nonblocking(fd) {
                tracing::warn!(fd, %errno, "failed to set O_NONBLOCK");
            }
            context::with_reactor(|r| r.register_fd(fd));
        }
        Socket { fd }
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Port the socket is bound to; useful after binding port 0.
    pub fn local_port(&self) -> io::Result<u16> {
        let addr = socket::getsockname::<SockaddrIn>(self.fd).map_err(io::Error::from)?;
        Ok(addr.port())
    }

    /// Read from the socket, suspending until data is available.
    ///
    /// Readiness is level-triggered and advisory: in rare cases the read
    /// can still return `WouldBlock`, which callers treat as a short read
    /// and re-await. `Ok(0)` means the peer closed the connection.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        wait_for_read(self.fd).await;
        nix::unistd::read(self.fd, buf).map_err(io::Error::from)
    }

    /// Write to the socket, suspending while the send buffer is full.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        wait_for_write(self.fd).await;
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        nix::unistd::write(fd, buf).map_err(io::Error::from)
    }

    /// Accept one connection, suspending until a client is pending. The
    /// returned socket is already non-blocking and registered.
    pub async fn accept(&self) -> io::Result<Socket> {
        wait_for_read(self.fd).await;
        let fd = socket::accept(self.fd).map_err(io::Error::from)?;
        Ok(Socket::from_fd(fd))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd < 0 {
            return;
        }

        // The runtime may already be gone when a leaked task's socket is
        // dropped during teardown; skip the unregistration then.
        if context::try_with_reactor(|r| r.unregister_fd(self.fd)).is_none() {
            tracing::debug!(fd = self.fd, "socket dropped outside the runtime");
        }

        if let Err(errno) = nix::unistd::close(self.fd) {
            tracing::warn!(fd = self.fd, %errno, "failed to close socket");
        }
        self.fd = -1;
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Create a listening socket bound to `host:port` (`SO_REUSEADDR` set).
///
/// Failures are logged and produce an invalid socket; callers detect this
/// via [`Socket::is_valid`]. Must be called from within the runtime.
pub fn listen(host: &str, port: u16) -> Socket {
    let invalid = Socket { fd: -1 };

    let Ok(addr) = host.parse::<Ipv4Addr>() else {
        tracing::error!(host, "invalid host address");
        return invalid;
    };

    let sock = match socket::socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    ) {
        Ok(fd) => fd,
        Err(errno) => {
            tracing::error!(%errno, "failed to create socket");
            return invalid;
        }
    };

    if let Err(errno) = socket::setsockopt(&sock, sockopt::ReuseAddr, &true) {
        tracing::error!(%errno, "failed to set SO_REUSEADDR");
        return invalid;
    }

    let sockaddr = SockaddrIn::from(SocketAddrV4::new(addr, port));
    if let Err(errno) = socket::bind(sock.as_raw_fd(), &sockaddr) {
        tracing::error!(%errno, host, port, "failed to bind socket");
        return invalid;
    }

    let backlog = match Backlog::new(LISTEN_BACKLOG) {
        Ok(backlog) => backlog,
        Err(errno) => {
            tracing::error!(%errno, "invalid listen backlog");
            return invalid;
        }
    };

    if let Err(errno) = socket::listen(&sock, backlog) {
        tracing::error!(%errno, "failed to listen on socket");
        return invalid;
    }

    // The fd now belongs to the Socket; from_fd registers it.
    Socket::from_fd(sock.into_raw_fd())
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Socket: Send, Sync);

    #[test]
    fn test_listen_rejects_bad_host() {
        // Fails before any fd is created, so no runtime is needed.
        let sock = listen("not-an-address", 0);
        assert!(!sock.is_valid());
        assert_eq!(sock.fd(), -1);
    }
}
