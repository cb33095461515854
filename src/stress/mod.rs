//! Stressor registry
//!
//! Maps a stressor name to the engine that runs one instance of it. Engines
//! rely on Linux-only kernel interfaces; elsewhere every stressor reports
//! `NotImplemented`, which the supervisor treats as a skip.

#[cfg(target_os = "linux")]
pub mod clock;
#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
pub mod memthrash;

use crate::config::types::{Result, StressConfig, StressError};
use crate::core::types::{ExitStatus, WorkloadContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stressor {
    Epoll,
    Memthrash,
    Clock,
}

impl Stressor {
    pub const fn all() -> &'static [Stressor] {
        &[Self::Epoll, Self::Memthrash, Self::Clock]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Epoll => "epoll",
            Self::Memthrash => "memthrash",
            Self::Clock => "clock",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Epoll => "connect/accept/read cycles through edge-triggered epoll servers",
            Self::Memthrash => "multi-threaded cache and memory thrashing",
            Self::Clock => "clock and POSIX timer system calls",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|s| s.name() == name)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::all().iter().map(|s| s.name()).collect();
                StressError::Config(format!(
                    "unknown stressor '{}', must be one of: {}",
                    name,
                    names.join(" ")
                ))
            })
    }

    /// Check the engine options in `config` without running anything
    pub fn prepare(self, config: &StressConfig) -> Result<()> {
        #[cfg(target_os = "linux")]
        match self {
            Self::Epoll => {
                epoll::EpollEngine::new(&config.epoll)?;
            }
            Self::Memthrash => {
                memthrash::methods::Method::from_name(&config.memthrash.method)?;
            }
            Self::Clock => {}
        }
        #[cfg(not(target_os = "linux"))]
        let _ = config;
        Ok(())
    }

    /// Remove filesystem state instance `instance` of a run started by `ppid`
    /// leaves behind when it is killed before its own cleanup
    pub fn release_instance(self, config: &StressConfig, ppid: u32, instance: u32) -> Result<()> {
        #[cfg(target_os = "linux")]
        if self == Self::Epoll {
            if epoll::EpollEngine::new(&config.epoll)?.remove_socket_file(ppid, instance)? {
                log::debug!(
                    "{}: removed socket file of instance {}",
                    config.diagnostic_name(),
                    instance
                );
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = (config, ppid, instance);
        Ok(())
    }

    /// Run one instance of this stressor to completion
    #[cfg(target_os = "linux")]
    pub fn run(self, ctx: &WorkloadContext, config: &StressConfig) -> ExitStatus {
        let engine = match self {
            Self::Epoll => epoll::EpollEngine::new(&config.epoll).map(|e| e.run(ctx)),
            Self::Memthrash => memthrash::MemthrashEngine::new(&config.memthrash).map(|e| e.run(ctx)),
            Self::Clock => Ok(clock::ClockEngine::new().run(ctx)),
        };
        engine.unwrap_or_else(|e| {
            log::error!("{}: {}", ctx.name, e);
            e.exit_status()
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn run(self, ctx: &WorkloadContext, _config: &StressConfig) -> ExitStatus {
        log::info!("{}: not implemented on this platform, skipping", ctx.name);
        ExitStatus::NotImplemented
    }
}

impl std::fmt::Display for Stressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
