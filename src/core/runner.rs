//! Multi-instance run supervisor
//!
//! Forks one process per engine instance, each with its own shared bogo-op
//! counter, and watches them at a fixed poll interval. A run ends when every
//! instance has exited, the timeout elapses, or a shutdown signal arrives.
//! Stopping is graceful first: SIGALRM flips the instances' run flag, and
//! whatever is still alive after the grace period is killed and reaped.
//! Once every instance is reaped, files a killed instance could not remove
//! are released here.

use crate::config::types::{Result, StressConfig, StressError};
use crate::config::validator::validate_config;
use crate::core::run_control::RunControl;
#[cfg(not(target_os = "linux"))]
use crate::core::spawner::spawn_process as spawn_instance;
#[cfg(target_os = "linux")]
use crate::core::spawner::spawn_tethered_process as spawn_instance;
use crate::core::spawner::{ProcessWorker, Worker};
use crate::core::types::{ExitStatus, SharedCounter, WorkloadContext};
use crate::kernel::signal::{self, ShutdownHandlers};
use crate::stress::Stressor;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use serde::{Serialize, Serializer};
use std::time::{Duration, Instant};

/// How often instance liveness, the deadline and signals are checked
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time instances get to wind down after SIGALRM before SIGKILL
pub const STOP_GRACE: Duration = Duration::from_secs(1);

fn as_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Outcome of one engine instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance: u32,
    pub pid: i32,
    pub bogo_ops: u64,
    pub status: ExitStatus,
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stressor: String,
    pub instances: u32,
    pub bogo_ops: u64,
    pub status: ExitStatus,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub reports: Vec<InstanceReport>,
    pub warnings: Vec<String>,
}

impl RunSummary {
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bogo_ops as f64 / secs
        } else {
            0.0
        }
    }
}

struct Instance {
    index: u32,
    worker: ProcessWorker,
    counter: SharedCounter,
    status: Option<ExitStatus>,
}

impl Instance {
    fn poll(&mut self) -> Result<bool> {
        if self.status.is_none() {
            self.status = self.worker.try_wait()?;
        }
        Ok(self.status.is_some())
    }
}

/// Why the watch loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    AllExited,
    Timeout,
    Signal,
}

pub struct Runner {
    config: StressConfig,
    stressor: Stressor,
    warnings: Vec<String>,
}

impl Runner {
    /// Validate `config` and resolve its stressor
    pub fn new(config: StressConfig) -> Result<Self> {
        let validation = validate_config(&config)?;
        for warning in &validation.warnings {
            warn!("{}: {}", config.diagnostic_name(), warning);
        }
        let stressor = Stressor::from_name(&config.stressor)?;
        Ok(Self {
            config,
            stressor,
            warnings: validation.warnings,
        })
    }

    pub fn stressor(&self) -> Stressor {
        self.stressor
    }

    fn spawn_instances(&self, name: &str) -> Result<Vec<Instance>> {
        let parent = std::process::id();
        let mut instances = Vec::with_capacity(self.config.instances as usize);

        for index in 0..self.config.instances {
            let counter = SharedCounter::new()?;
            let ctx = WorkloadContext::new(name, index, self.config.ops)?
                .with_instances(self.config.instances)
                .with_parent(parent)
                .with_counter(counter.clone())
                .with_run_control(RunControl::process());
            let stressor = self.stressor;
            let config = &self.config;

            // On error, instances already started are killed and reaped on drop.
            let worker = spawn_instance(move || stressor.run(&ctx, config))?;
            debug!("{}: instance {} started as pid {}", name, index, worker.pid());
            instances.push(Instance {
                index,
                worker,
                counter,
                status: None,
            });
        }
        Ok(instances)
    }

    fn watch(&self, instances: &mut [Instance], started: Instant) -> Result<StopReason> {
        loop {
            let mut running = 0;
            for instance in instances.iter_mut() {
                if !instance.poll()? {
                    running += 1;
                }
            }
            if running == 0 {
                return Ok(StopReason::AllExited);
            }
            if signal::shutdown_requested() {
                return Ok(StopReason::Signal);
            }
            if let Some(timeout) = self.config.timeout {
                if started.elapsed() >= timeout {
                    return Ok(StopReason::Timeout);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// SIGALRM everything still running, wait out the grace period, then kill
    fn stop(&self, name: &str, instances: &mut [Instance]) -> Result<()> {
        for instance in instances.iter().filter(|i| i.status.is_none()) {
            instance.worker.signal(Signal::SIGALRM)?;
        }

        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            let mut running = 0;
            for instance in instances.iter_mut() {
                if !instance.poll()? {
                    running += 1;
                }
            }
            if running == 0 {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        for instance in instances.iter_mut().filter(|i| i.status.is_none()) {
            warn!(
                "{}: instance {} ignored SIGALRM, killing pid {}",
                name,
                instance.index,
                instance.worker.pid()
            );
            instance.worker.terminate();
            while !instance.poll()? {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    /// Remove what instances killed mid-run left on disk
    fn release(&self, name: &str, instances: &[Instance]) {
        let parent = std::process::id();
        for instance in instances {
            if let Err(e) = self.stressor.release_instance(&self.config, parent, instance.index) {
                warn!("{}: instance {} cleanup: {}", name, instance.index, e);
            }
        }
    }

    /// Run every instance to completion and fold their results
    pub fn run(&self) -> Result<RunSummary> {
        ShutdownHandlers::install().map_err(StressError::Setup)?;
        signal::reset_shutdown();

        let name = self.config.diagnostic_name();
        let started = Instant::now();
        info!(
            "{}: dispatching {} instance(s) of {}",
            name, self.config.instances, self.stressor
        );

        let mut instances = self.spawn_instances(&name)?;
        let reason = self.watch(&mut instances, started)?;
        match (reason, signal::last_signal()) {
            (StopReason::Signal, Some(sig)) => info!("{}: {} received, stopping", name, sig),
            _ => debug!("{}: stopping ({:?})", name, reason),
        }
        if reason != StopReason::AllExited {
            self.stop(&name, &mut instances)?;
        }
        let elapsed = started.elapsed();
        self.release(&name, &instances);

        let mut status = ExitStatus::Success;
        let mut bogo_ops = 0;
        let reports: Vec<InstanceReport> = instances
            .into_iter()
            .map(|instance| {
                let instance_status = instance.status.unwrap_or(ExitStatus::Failure);
                status = status.worst(instance_status);
                bogo_ops += instance.counter.get();
                InstanceReport {
                    instance: instance.index,
                    pid: instance.worker.pid().as_raw(),
                    bogo_ops: instance.counter.get(),
                    status: instance_status,
                }
            })
            .collect();

        if status == ExitStatus::NotImplemented {
            info!("{}: skipped, not implemented on this platform", name);
        }

        Ok(RunSummary {
            stressor: self.stressor.name().to_string(),
            instances: self.config.instances,
            bogo_ops,
            status,
            elapsed,
            reports,
            warnings: self.warnings.clone(),
        })
    }
}

/// Validate, run and summarise in one call
pub fn run(config: StressConfig) -> Result<RunSummary> {
    Runner::new(config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn invalid_config_never_spawns() {
        let config = StressConfig {
            instances: 0,
            ..StressConfig::default()
        };
        assert!(Runner::new(config).is_err());
    }

    #[test]
    #[serial]
    fn capped_clock_run_reports_every_instance() {
        let config = StressConfig {
            stressor: "clock".to_string(),
            instances: 2,
            ops: 10,
            ..StressConfig::default()
        };
        let summary = run(config).unwrap();
        assert_eq!(summary.status, ExitStatus::Success);
        assert_eq!(summary.reports.len(), 2);
        assert!(summary.reports.iter().all(|r| r.bogo_ops == 10));
        assert_eq!(summary.bogo_ops, 20);
    }

    #[test]
    #[serial]
    fn timeout_stops_an_unbounded_run() {
        let config = StressConfig {
            stressor: "clock".to_string(),
            timeout: Some(Duration::from_millis(300)),
            ..StressConfig::default()
        };
        let summary = run(config).unwrap();
        assert_eq!(summary.status, ExitStatus::Success);
        assert!(summary.bogo_ops > 0);
        assert!(summary.elapsed < Duration::from_secs(3));
    }

    #[test]
    fn summary_serialises_elapsed_as_seconds() {
        let summary = RunSummary {
            stressor: "clock".to_string(),
            instances: 1,
            bogo_ops: 10,
            status: ExitStatus::Success,
            elapsed: Duration::from_millis(1500),
            reports: Vec::new(),
            warnings: Vec::new(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["elapsed"], 1.5);
        assert_eq!(json["status"], "Success");
        assert!((summary.ops_per_sec() - 10.0 / 1.5).abs() < 1e-9);
    }
}
