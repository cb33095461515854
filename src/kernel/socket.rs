/// Stream socket primitives used by the socket stressors
///
/// Descriptors come back as `OwnedFd` so every error branch closes what it opened.
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    self, accept4, bind, connect, listen, setsockopt, sockopt, AddressFamily, MsgFlags, SockFlag,
    SockType, SockaddrLike,
};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Wrap a raw descriptor returned by a syscall.
///
/// # Safety
/// `fd` must be open and not owned by anything else.
pub unsafe fn own_fd(fd: RawFd) -> OwnedFd {
    OwnedFd::from_raw_fd(fd)
}

/// Open a close-on-exec stream socket in `family`
pub fn stream_socket(family: AddressFamily) -> nix::Result<OwnedFd> {
    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    // SAFETY: socket() just returned this descriptor.
    Ok(unsafe { own_fd(fd) })
}

pub fn set_reuse_addr(fd: &OwnedFd) -> nix::Result<()> {
    setsockopt(fd.as_raw_fd(), sockopt::ReuseAddr, &true)
}

pub fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub fn bind_to(fd: &OwnedFd, addr: &dyn SockaddrLike) -> nix::Result<()> {
    bind(fd.as_raw_fd(), addr)
}

/// Listen with the largest backlog the kernel allows
pub fn listen_max(fd: &OwnedFd) -> nix::Result<()> {
    listen(fd.as_raw_fd(), libc::SOMAXCONN as usize)
}

/// Accept one pending connection as a non-blocking descriptor
pub fn accept_nonblocking(listener: RawFd) -> nix::Result<OwnedFd> {
    let fd = accept4(listener, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC)?;
    // SAFETY: accept4() just returned this descriptor.
    Ok(unsafe { own_fd(fd) })
}

/// Blocking connect; interrupted by a signal as `EINTR`
pub fn connect_to(fd: &OwnedFd, addr: &dyn SockaddrLike) -> nix::Result<()> {
    connect(fd.as_raw_fd(), addr)
}

pub fn recv_into(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    socket::recv(fd, buf, MsgFlags::empty())
}

/// Send without raising SIGPIPE when the peer is gone
pub fn send_all(fd: &OwnedFd, buf: &[u8]) -> nix::Result<usize> {
    socket::send(fd.as_raw_fd(), buf, MsgFlags::MSG_NOSIGNAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::SockaddrIn;

    #[test]
    fn loopback_listener_accepts_nonblocking() {
        let listener = stream_socket(AddressFamily::Inet).unwrap();
        set_reuse_addr(&listener).unwrap();
        bind_to(&listener, &SockaddrIn::new(127, 0, 0, 1, 0)).unwrap();
        set_nonblocking(&listener).unwrap();
        listen_max(&listener).unwrap();

        // Nothing pending yet.
        assert_eq!(
            accept_nonblocking(listener.as_raw_fd()).unwrap_err(),
            nix::errno::Errno::EAGAIN
        );

        let bound: SockaddrIn = socket::getsockname(listener.as_raw_fd()).unwrap();
        let client = stream_socket(AddressFamily::Inet).unwrap();
        connect_to(&client, &bound).unwrap();

        let conn = accept_nonblocking(listener.as_raw_fd()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(
            recv_into(conn.as_raw_fd(), &mut buf).unwrap_err(),
            nix::errno::Errno::EAGAIN
        );

        assert_eq!(send_all(&client, b"abc").unwrap(), 3);
    }
}
