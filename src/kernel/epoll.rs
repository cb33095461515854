/// Edge-triggered readiness notification
///
/// One notifier per server process. It owns the listening socket and every
/// accepted connection, so closing a connection is removing it from the map:
/// the kernel drops a closed fd from the interest list on its own.
use crate::config::types::{Result, StressError};
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// Event batch capacity per wait
pub const MAX_EPOLL_EVENTS: usize = 1024;

/// What one readiness event asks the server to do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Listening socket has pending connections
    Accept,
    /// Connection has data or EOF pending
    Readable(RawFd),
    /// Error, hangup or no longer readable
    Broken(RawFd),
}

pub struct EventNotifier {
    epfd: OwnedFd,
    listener: Option<OwnedFd>,
    connections: HashMap<RawFd, OwnedFd>,
    events: Vec<EpollEvent>,
}

impl EventNotifier {
    pub fn new() -> Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|e| StressError::setup("epoll_create1", e))?;
        Ok(Self {
            // SAFETY: epoll_create1 returned a fresh descriptor we now own.
            epfd: unsafe { crate::kernel::socket::own_fd(epfd) },
            listener: None,
            connections: HashMap::new(),
            events: vec![EpollEvent::empty(); MAX_EPOLL_EVENTS],
        })
    }

    fn watch(&self, fd: RawFd) -> nix::Result<()> {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, fd as u64);
        epoll_ctl(self.epfd.as_raw_fd(), EpollOp::EpollCtlAdd, fd, &mut event)
    }

    /// Take ownership of the listening socket and watch it
    pub fn watch_listener(&mut self, listener: OwnedFd) -> Result<()> {
        self.watch(listener.as_raw_fd())
            .map_err(|e| StressError::setup("epoll_ctl add listener", e))?;
        self.listener = Some(listener);
        Ok(())
    }

    pub fn listener_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Take ownership of an accepted connection and watch it.
    /// On failure the connection is closed.
    pub fn register(&mut self, conn: OwnedFd) -> nix::Result<()> {
        let fd = conn.as_raw_fd();
        self.watch(fd)?;
        self.connections.insert(fd, conn);
        Ok(())
    }

    /// Close a connection (or stray descriptor) reported by an event
    pub fn close(&mut self, fd: RawFd) {
        if self.connections.remove(&fd).is_none() && Some(fd) != self.listener_fd() {
            log::debug!("event for unknown fd {}", fd);
        }
    }

    /// Number of live registered connections
    pub fn registered(&self) -> usize {
        self.connections.len()
    }

    /// Wait up to `timeout_ms` for a batch of events.
    /// Returns the classified batch; `EINTR` yields an empty batch.
    pub fn wait(&mut self, timeout_ms: isize) -> Result<Vec<Readiness>> {
        self.events.fill(EpollEvent::empty());
        let n = match epoll_wait(self.epfd.as_raw_fd(), &mut self.events, timeout_ms) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(StressError::Io(e.into())),
        };

        let listener = self.listener_fd();
        Ok(self.events[..n]
            .iter()
            .map(|ev| {
                let fd = ev.data() as RawFd;
                let flags = ev.events();
                if flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP)
                    || !flags.contains(EpollFlags::EPOLLIN)
                {
                    Readiness::Broken(fd)
                } else if Some(fd) == listener {
                    Readiness::Accept
                } else {
                    Readiness::Readable(fd)
                }
            })
            .collect())
    }
}
