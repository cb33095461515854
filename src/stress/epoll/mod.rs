//! Epoll socket stressor
//!
//! One instance forks a server process per listening port, then runs the
//! client in the calling process until cancellation or the operation cap:
//!
//! ```text
//! instance ──fork──> server[0..max_servers]   (accept + drain, edge-triggered)
//!    │
//!    └── client: connect (timer-guarded) -> send 4 KiB -> close -> count
//! ```
//!
//! Whatever happens to the client, every forked server is killed and reaped
//! before the instance returns, and a unix socket file is removed. Servers
//! are tethered to the instance, so an instance killed outright takes its
//! servers with it; its socket file is then left for the supervisor to remove
//! through [`EpollEngine::remove_socket_file`].

pub mod client;
pub mod domain;
pub mod server;

use crate::config::types::{EpollOptions, Result};
use crate::core::spawner::{spawn_tethered_process, ProcessWorker, Worker};
use crate::core::types::{ExitStatus, SharedCounter, WorkloadContext};
use crate::safety::artifact::SocketArtifact;
use client::{ClientReport, EpollClient};
use domain::{check_port_range, unix_socket_path, SocketDomain};
use log::{debug, error};
use std::path::{Path, PathBuf};

/// Validated settings for one epoll engine
#[derive(Debug, Clone)]
pub struct EpollEngine {
    domain: SocketDomain,
    port: u16,
    socket_dir: PathBuf,
    accept_counter: Option<SharedCounter>,
}

impl EpollEngine {
    pub fn new(options: &EpollOptions) -> Result<Self> {
        Ok(Self {
            domain: SocketDomain::from_name(&options.domain)?,
            port: options.port,
            socket_dir: options.socket_dir(),
            accept_counter: None,
        })
    }

    /// Servers add every accepted connection to `counter`
    pub fn with_accept_counter(mut self, counter: SharedCounter) -> Self {
        self.accept_counter = Some(counter);
        self
    }

    pub fn domain(&self) -> SocketDomain {
        self.domain
    }

    /// Socket file used by `ctx`'s instance (unix domain only)
    pub fn socket_path(&self, ctx: &WorkloadContext) -> PathBuf {
        unix_socket_path(&self.socket_dir, ctx.ppid, ctx.instance)
    }

    /// Remove the socket file of an instance that died before its own cleanup.
    /// Returns true if a file was deleted.
    pub fn remove_socket_file(&self, ppid: u32, instance: u32) -> Result<bool> {
        if self.domain != SocketDomain::Unix {
            return Ok(false);
        }
        SocketArtifact::new(unix_socket_path(&self.socket_dir, ppid, instance)).remove()
    }

    fn log_port_range(&self, ctx: &WorkloadContext) {
        let first = self.domain.first_port(self.port, ctx.instance);
        let servers = self.domain.max_servers() as u32;
        if servers == 1 {
            debug!(
                "{}: process [{}] using socket port {}",
                ctx.name,
                std::process::id(),
                first
            );
        } else {
            debug!(
                "{}: process [{}] using socket ports {}..{}",
                ctx.name,
                std::process::id(),
                first,
                first + servers - 1
            );
        }
    }

    fn spawn_servers(&self, ctx: &WorkloadContext, path: &Path) -> Result<Vec<ProcessWorker>> {
        let mut servers = Vec::with_capacity(self.domain.max_servers() as usize);
        for child in 0..self.domain.max_servers() {
            let port = self.domain.server_port(self.port, child, ctx.instance);
            let server_ctx = ctx.clone();
            let domain = self.domain;
            let counter = self.accept_counter.clone();
            match spawn_tethered_process(|| server::serve(&server_ctx, domain, port, path, counter)) {
                Ok(worker) => servers.push(worker),
                Err(e) => {
                    error!("{}: {}", ctx.name, e);
                    reap(&ctx.name, servers);
                    return Err(e);
                }
            }
        }
        Ok(servers)
    }

    /// Run one engine instance to completion
    pub fn run(&self, ctx: &WorkloadContext) -> ExitStatus {
        // The instance index alone can reach past the declared instance count.
        let span = ctx.instances.max(ctx.instance.saturating_add(1));
        if let Err(e) = check_port_range(self.port, self.domain, span) {
            error!("{}: {}", ctx.name, e);
            return e.exit_status();
        }
        self.log_port_range(ctx);

        let path = self.socket_path(ctx);
        let artifact = (self.domain == SocketDomain::Unix).then(|| SocketArtifact::new(&path));

        let servers = match self.spawn_servers(ctx, &path) {
            Ok(servers) => servers,
            Err(e) => return e.exit_status(),
        };

        let status = match self.run_client(ctx, &path) {
            Ok(report) => {
                debug!("{}: {} connections delivered", ctx.name, report.connects);
                ExitStatus::Success
            }
            Err(e) => {
                error!("{}: {}", ctx.name, e);
                e.exit_status()
            }
        };

        reap(&ctx.name, servers);
        drop(artifact);
        status
    }

    fn run_client(&self, ctx: &WorkloadContext, path: &Path) -> Result<ClientReport> {
        EpollClient::new(&ctx.name, self.domain, self.port, ctx.instance, path).run(ctx)
    }
}

/// Kill and wait for every server
fn reap(name: &str, servers: Vec<ProcessWorker>) {
    for mut server in servers {
        let pid = server.pid();
        server.terminate();
        if let Err(e) = server.join() {
            error!("{}: waitpid {}: {}", name, pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_domain_is_rejected() {
        let options = EpollOptions {
            domain: "sctp".to_string(),
            ..EpollOptions::default()
        };
        assert!(EpollEngine::new(&options).is_err());
    }

    #[test]
    fn bad_port_fails_before_spawning() {
        let options = EpollOptions {
            port: 80,
            ..EpollOptions::default()
        };
        let engine = EpollEngine::new(&options).unwrap();
        let ctx = WorkloadContext::new("epoll", 0, 1).unwrap();
        assert_eq!(engine.run(&ctx), ExitStatus::Failure);
    }

    #[test]
    fn instance_index_beyond_count_cannot_wrap_ports() {
        let options = EpollOptions {
            domain: "ipv4".to_string(),
            port: 65500,
            ..EpollOptions::default()
        };
        let engine = EpollEngine::new(&options).unwrap();
        // 65500 + 4 * 9 would narrow to a port near zero.
        let ctx = WorkloadContext::new("epoll", 9, 1).unwrap();
        assert_eq!(ctx.instances, 1);
        assert_eq!(engine.run(&ctx), ExitStatus::Failure);
        assert_eq!(ctx.bogo_ops(), 0);
    }

    #[test]
    fn socket_path_is_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let options = EpollOptions {
            socket_dir: Some(dir.path().to_path_buf()),
            ..EpollOptions::default()
        };
        let engine = EpollEngine::new(&options).unwrap();
        let ctx = WorkloadContext::new("epoll", 2, 0).unwrap().with_parent(77);
        assert_eq!(engine.socket_path(&ctx), dir.path().join("stressbox-77-2"));
    }
}
