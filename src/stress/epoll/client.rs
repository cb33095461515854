//! Epoll client role
//!
//! Connects to the instance's servers round-robin, writes one payload per
//! connection and closes it. Every connect is guarded by a per-attempt timer so
//! a full connection table shows up as a counted timeout, not a hang.

use crate::config::types::{Result, StressError};
use crate::core::types::WorkloadContext;
use crate::kernel::socket::{connect_to, send_all, stream_socket};
use crate::kernel::timer::{ConnectTimer, CONNECT_TIMEOUT};
use crate::stress::epoll::domain::{Endpoint, SocketDomain};
use log::{debug, error};
use nix::errno::Errno;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Consecutive failed attempts tolerated for one connection
pub const MAX_CONNECT_RETRIES: u32 = 100;

/// Bytes written per connection
pub const PAYLOAD_SIZE: usize = 4096;

const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Round-robin over the ports one instance's servers listen on
#[derive(Debug, Clone)]
pub struct PortRotation {
    first: u32,
    servers: u16,
    next: u16,
}

impl PortRotation {
    pub fn new(domain: SocketDomain, base: u16, instance: u32) -> Self {
        Self {
            first: domain.first_port(base, instance),
            servers: domain.max_servers(),
            next: 0,
        }
    }

    pub fn next_port(&mut self) -> u16 {
        let port = (self.first + self.next as u32) as u16;
        self.next = (self.next + 1) % self.servers;
        port
    }
}

/// Result of one guarded connect attempt
#[derive(Debug)]
pub enum ConnectOutcome {
    Connected(OwnedFd),
    /// Timer fired while connect was blocked
    TimedOut,
    /// Refused, missing socket file or any other connect error
    Failed(Errno),
}

/// Tallies reported when the client stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientReport {
    pub connects: u64,
    pub connect_timeouts: u64,
}

pub struct EpollClient {
    name: String,
    domain: SocketDomain,
    path: PathBuf,
    rotation: PortRotation,
    timeout: Duration,
    report: ClientReport,
}

impl EpollClient {
    pub fn new(name: &str, domain: SocketDomain, base: u16, instance: u32, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            domain,
            path: path.to_path_buf(),
            rotation: PortRotation::new(domain, base, instance),
            timeout: CONNECT_TIMEOUT,
            report: ClientReport::default(),
        }
    }

    pub fn report(&self) -> ClientReport {
        self.report
    }

    /// One connect attempt with the timer armed. Socket and timer are released
    /// on every path; only a failure to create them is an error.
    pub fn connect_once(&mut self, port: u16) -> Result<ConnectOutcome> {
        let socket = stream_socket(self.domain.family())
            .map_err(|e| StressError::setup(&format!("{}: socket", self.name), e))?;
        let endpoint = Endpoint::loopback(self.domain, port, &self.path)?;

        let timer = ConnectTimer::arm(self.timeout)?;
        let result = connect_to(&socket, endpoint.as_sockaddr());
        drop(timer);

        Ok(match result {
            Ok(()) => ConnectOutcome::Connected(socket),
            Err(Errno::EINTR) => {
                self.report.connect_timeouts += 1;
                ConnectOutcome::TimedOut
            }
            Err(e) => {
                if !matches!(e, Errno::ECONNREFUSED | Errno::ENOENT) {
                    debug!("{}: connect failed: {}", self.name, e);
                }
                ConnectOutcome::Failed(e)
            }
        })
    }

    /// Connect until one attempt succeeds, cancellation, or the retry budget
    /// is spent. `Ok(None)` means cancelled.
    fn connect_with_retry(&mut self, ctx: &WorkloadContext, port: u16) -> Result<Option<OwnedFd>> {
        let mut retries = 0;
        loop {
            if !ctx.run.keep_running() {
                return Ok(None);
            }
            match self.connect_once(port)? {
                ConnectOutcome::Connected(fd) => return Ok(Some(fd)),
                ConnectOutcome::TimedOut | ConnectOutcome::Failed(_) => {
                    std::thread::sleep(RETRY_BACKOFF);
                    retries += 1;
                    if retries > MAX_CONNECT_RETRIES {
                        error!("{}: connect failed after {} retries", self.name, retries);
                        return Err(StressError::RetryExhausted { attempts: retries });
                    }
                }
            }
        }
    }

    /// Client loop: one counted operation per delivered connection
    pub fn run(&mut self, ctx: &WorkloadContext) -> Result<ClientReport> {
        let mut payload = [0u8; PAYLOAD_SIZE];

        while ctx.keep_stressing() {
            let port = self.rotation.next_port();
            let Some(conn) = self.connect_with_retry(ctx, port)? else {
                break;
            };

            payload.fill(b'A' + (ctx.bogo_ops() % 26) as u8);
            if let Err(e) = send_all(&conn, &payload) {
                error!("{}: send: {}", self.name, e);
                break;
            }
            drop(conn);
            std::thread::yield_now();

            ctx.inc_counter();
            self.report.connects += 1;
        }

        if self.report.connect_timeouts > 0 {
            debug!(
                "{}: {} x {:.2} second connect timeouts, connection table full (instance {})",
                self.name,
                self.report.connect_timeouts,
                self.timeout.as_secs_f64(),
                ctx.instance
            );
        }
        Ok(self.report)
    }
}
