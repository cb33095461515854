//! Epoll server role

use crate::config::types::{Result, StressError};
use crate::core::types::{ExitStatus, SharedCounter, WorkloadContext};
use crate::kernel::epoll::{EventNotifier, Readiness};
use crate::kernel::socket::{
    accept_nonblocking, bind_to, listen_max, recv_into, set_nonblocking, set_reuse_addr,
    stream_socket,
};
use crate::safety::artifact::SocketArtifact;
use crate::stress::epoll::domain::{Endpoint, SocketDomain};
use nix::errno::Errno;
use std::marker::PhantomData;
use std::os::fd::{OwnedFd, RawFd};
use std::path::Path;

/// Wait granularity of the event loop; bounds cancellation latency
pub const POLL_INTERVAL_MS: isize = 100;

/// Receive buffer size for draining connections
const RECV_BUF_SIZE: usize = 8192;

/// Type-state marker: socket created and configured, not yet bound
pub struct Init;

/// Type-state marker: socket bound to its domain address
pub struct Bound;

/// Type-state marker: listening and registered with the event notifier
pub struct Listening;

/// What one pass of the event loop did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub events: usize,
    pub accepted: usize,
    pub closed: usize,
}

/// Listening endpoint of one epoll instance.
///
/// The socket setup order is fixed and encoded as a type-state chain:
///
/// Init -> Bound -> Listening
///
/// Each step consumes the prior state. Only `EpollServer<Listening>` can poll,
/// so a server that never bound or listened cannot reach the event loop:
///
/// ```compile_fail
/// use std::path::Path;
/// use stressbox::stress::epoll::domain::SocketDomain;
/// use stressbox::stress::epoll::server::EpollServer;
///
/// let mut server = EpollServer::new("epoll", SocketDomain::Ipv4, 0, Path::new("/tmp/unused")).unwrap();
/// server.poll_once(100).unwrap();
/// ```
///
/// ```compile_fail
/// use std::path::Path;
/// use stressbox::stress::epoll::domain::SocketDomain;
/// use stressbox::stress::epoll::server::EpollServer;
///
/// let server = EpollServer::new("epoll", SocketDomain::Ipv4, 0, Path::new("/tmp/unused")).unwrap();
/// let mut bound = server.bind().unwrap();
/// bound.poll_once(100).unwrap();
/// ```
pub struct EpollServer<S> {
    name: String,
    domain: SocketDomain,
    endpoint: Endpoint,
    socket: Option<OwnedFd>,
    notifier: EventNotifier,
    artifact: Option<SocketArtifact>,
    accepted: u64,
    accept_counter: Option<SharedCounter>,
    _state: PhantomData<S>,
}

impl<S> EpollServer<S> {
    fn into_state<T>(self) -> EpollServer<T> {
        EpollServer {
            name: self.name,
            domain: self.domain,
            endpoint: self.endpoint,
            socket: self.socket,
            notifier: self.notifier,
            artifact: self.artifact,
            accepted: self.accepted,
            accept_counter: self.accept_counter,
            _state: PhantomData,
        }
    }

    fn socket(&self) -> Result<&OwnedFd> {
        self.socket
            .as_ref()
            .ok_or_else(|| StressError::Setup(format!("{}: socket already handed off", self.name)))
    }

    pub fn domain(&self) -> SocketDomain {
        self.domain
    }
}

impl EpollServer<Init> {
    /// Create the listening socket with address reuse enabled and resolve the
    /// domain address (`path` is only used by the unix domain).
    pub fn new(name: &str, domain: SocketDomain, port: u16, path: &Path) -> Result<Self> {
        let socket = stream_socket(domain.family())
            .map_err(|e| StressError::setup(&format!("{}: socket", name), e))?;
        set_reuse_addr(&socket)
            .map_err(|e| StressError::setup(&format!("{}: setsockopt", name), e))?;
        let endpoint = Endpoint::listen(domain, port, path)?;
        let notifier = EventNotifier::new()?;

        Ok(Self {
            name: name.to_string(),
            domain,
            endpoint,
            socket: Some(socket),
            notifier,
            artifact: None,
            accepted: 0,
            accept_counter: None,
            _state: PhantomData,
        })
    }

    /// Transition to Bound
    pub fn bind(mut self) -> Result<EpollServer<Bound>> {
        if let Endpoint::Unix(addr) = &self.endpoint {
            if let Some(path) = addr.path() {
                self.artifact = Some(SocketArtifact::claim(path)?);
            }
        }
        bind_to(self.socket()?, self.endpoint.as_sockaddr())
            .map_err(|e| StressError::setup(&format!("{}: bind", self.name), e))?;
        Ok(self.into_state())
    }
}

impl EpollServer<Bound> {
    /// Transition to Listening: non-blocking, maximum backlog, and handed to
    /// the notifier which owns it from here on.
    pub fn listen(mut self) -> Result<EpollServer<Listening>> {
        let socket = self.socket()?;
        set_nonblocking(socket).map_err(|e| {
            StressError::setup(&format!("{}: setting socket to non-blocking", self.name), e)
        })?;
        listen_max(socket).map_err(|e| StressError::setup(&format!("{}: listen", self.name), e))?;

        let socket = self
            .socket
            .take()
            .ok_or_else(|| StressError::Setup(format!("{}: socket missing", self.name)))?;
        self.notifier.watch_listener(socket)?;
        Ok(self.into_state())
    }
}

impl EpollServer<Listening> {
    /// Mirror every accepted connection into `counter`
    pub fn with_accept_counter(mut self, counter: SharedCounter) -> Self {
        self.accept_counter = Some(counter);
        self
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Connections currently registered with the notifier
    pub fn registered(&self) -> usize {
        self.notifier.registered()
    }

    /// Port actually bound (useful after binding port 0)
    pub fn local_port(&self) -> Option<u16> {
        use nix::sys::socket::{getsockname, SockaddrStorage};
        let fd = self.notifier.listener_fd()?;
        let addr: SockaddrStorage = getsockname(fd).ok()?;
        addr.as_sockaddr_in()
            .map(|a| a.port())
            .or_else(|| addr.as_sockaddr_in6().map(|a| a.port()))
    }

    /// Wait up to `timeout_ms` for one batch of events and handle all of it
    pub fn poll_once(&mut self, timeout_ms: isize) -> Result<PollOutcome> {
        let batch = self.notifier.wait(timeout_ms)?;
        let mut outcome = PollOutcome {
            events: batch.len(),
            ..PollOutcome::default()
        };

        for readiness in batch {
            match readiness {
                Readiness::Broken(fd) => {
                    self.notifier.close(fd);
                    outcome.closed += 1;
                }
                Readiness::Accept => match self.accept_pending() {
                    Ok(n) => outcome.accepted += n,
                    Err(e) => {
                        log::warn!("{}: accept: {}", self.name, e);
                        break;
                    }
                },
                Readiness::Readable(fd) => {
                    if self.drain(fd) {
                        outcome.closed += 1;
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Accept until the backlog is empty. Edge-triggered notification fires
    /// once for any number of pending connections, so stopping early would
    /// strand them. Running out of descriptors ends the drain quietly.
    fn accept_pending(&mut self) -> Result<usize> {
        let listener = self
            .notifier
            .listener_fd()
            .ok_or_else(|| StressError::Setup(format!("{}: no listener", self.name)))?;
        let mut accepted = 0;

        loop {
            let conn = match accept_nonblocking(listener) {
                Ok(conn) => conn,
                Err(Errno::EAGAIN) => return Ok(accepted),
                Err(Errno::EMFILE) | Err(Errno::ENFILE) => return Ok(accepted),
                Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
                Err(e) => return Err(StressError::Io(e.into())),
            };

            self.notifier
                .register(conn)
                .map_err(|e| StressError::Io(e.into()))?;
            accepted += 1;
            self.accepted += 1;
            if let Some(counter) = &self.accept_counter {
                counter.inc();
            }
        }
    }

    /// Read until the socket would block or the peer shut down.
    /// Returns true if the connection was closed.
    fn drain(&mut self, fd: RawFd) -> bool {
        let mut buf = [0u8; RECV_BUF_SIZE];
        loop {
            match recv_into(fd, &mut buf) {
                Ok(0) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return false,
                Err(_) => break,
            }
        }
        self.notifier.close(fd);
        true
    }

    /// Event loop: poll until cancelled or the shared counter hits the cap
    pub fn run(mut self, ctx: &WorkloadContext) -> Result<u64> {
        while ctx.keep_stressing() {
            self.poll_once(POLL_INTERVAL_MS)?;
        }
        Ok(self.accepted)
    }

    /// Listening descriptor, for tests that connect directly
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.notifier.listener_fd()
    }
}

/// Full server lifetime for one port; the body of a forked server process.
/// Everything acquired is released when the server value drops, on every path.
pub fn serve(
    ctx: &WorkloadContext,
    domain: SocketDomain,
    port: u16,
    path: &Path,
    accept_counter: Option<SharedCounter>,
) -> ExitStatus {
    let result = EpollServer::new(&ctx.name, domain, port, path)
        .and_then(|server| server.bind())
        .and_then(|server| server.listen())
        .and_then(|server| match accept_counter {
            Some(counter) => server.with_accept_counter(counter).run(ctx),
            None => server.run(ctx),
        });

    match result {
        Ok(accepted) => {
            log::debug!("{}: server on port {} accepted {} connections", ctx.name, port, accepted);
            ExitStatus::Success
        }
        Err(e) => {
            log::error!("{}: {}", ctx.name, e);
            e.exit_status()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn unix_server(dir: &Path) -> (EpollServer<Listening>, std::path::PathBuf) {
        let path = dir.join("srv.sock");
        let server = EpollServer::new("test", SocketDomain::Unix, 0, &path)
            .and_then(|server| server.bind())
            .and_then(|server| server.listen())
            .unwrap();
        (server, path)
    }

    #[test]
    fn burst_of_connections_is_fully_accepted_from_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, path) = unix_server(dir.path());

        const K: usize = 64;
        let clients: Vec<UnixStream> = (0..K).map(|_| UnixStream::connect(&path).unwrap()).collect();

        let outcome = server.poll_once(1000).unwrap();
        assert_eq!(outcome.events, 1);
        assert_eq!(outcome.accepted, K);
        assert_eq!(server.registered(), K);
        drop(clients);
    }

    #[test]
    fn closed_peers_are_drained_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let (mut server, path) = unix_server(dir.path());

        let mut client = UnixStream::connect(&path).unwrap();
        server.poll_once(1000).unwrap();
        assert_eq!(server.registered(), 1);

        use std::io::Write;
        client.write_all(&[b'A'; 4096]).unwrap();
        drop(client);

        let mut closed = 0;
        for _ in 0..10 {
            closed += server.poll_once(100).unwrap().closed;
            if server.registered() == 0 {
                break;
            }
        }
        assert_eq!(closed, 1);
        assert_eq!(server.registered(), 0);
        assert_eq!(server.accepted(), 1);
    }

    #[test]
    fn dropping_server_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let (server, path) = unix_server(dir.path());
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn ipv4_server_binds_ephemeral_port() {
        let server = EpollServer::new("test", SocketDomain::Ipv4, 0, Path::new("/unused"))
            .and_then(|server| server.bind())
            .and_then(|server| server.listen())
            .unwrap();
        assert!(server.local_port().unwrap() > 0);
        assert_eq!(server.domain(), SocketDomain::Ipv4);
    }

    #[test]
    fn run_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _path) = unix_server(dir.path());
        let ctx = WorkloadContext::new("test", 0, 0).unwrap();
        ctx.run.request_stop();
        assert_eq!(server.run(&ctx).unwrap(), 0);
    }
}
