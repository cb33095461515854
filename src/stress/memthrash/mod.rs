//! Memthrash stressor
//!
//! One shared region per instance, one worker thread per processor share.
//! Each worker walks the working-set scales, running the selected method once
//! per scale and counting it. The controlling thread only polls for
//! cancellation; it then stops, joins and finally unmaps.

pub mod methods;

use crate::config::types::{MemthrashOptions, Result, StressError};
use crate::core::run_control::RunControl;
use crate::core::spawner::{spawn_thread, ThreadWorker, Worker};
use crate::core::types::{ExitStatus, WorkloadContext};
use crate::utils::rng::StressRng;
use log::{debug, error, warn};
use methods::{scales, MemoryRegion, Method, MEM_SIZE};
use std::sync::Arc;
use std::time::Duration;

/// How often the controlling thread checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Workload handed to a thread spawner
pub type Workload = Box<dyn FnOnce() -> ExitStatus + Send + 'static>;

/// Worker threads per instance so that all instances together roughly fill
/// the host without oversubscribing it.
pub fn threads_per_instance(cpus: usize, instances: u32) -> usize {
    let instances = instances as usize;
    if instances == 0 || instances >= cpus {
        1
    } else {
        cpus.div_ceil(instances)
    }
}

#[derive(Debug, Clone)]
pub struct MemthrashEngine {
    method: Method,
    cpus: usize,
    region_len: usize,
}

impl MemthrashEngine {
    pub fn new(options: &MemthrashOptions) -> Result<Self> {
        Ok(Self {
            method: Method::from_name(&options.method)?,
            cpus: options.cpus(),
            region_len: MEM_SIZE,
        })
    }

    /// Thrash a smaller region; working sets are clamped to it
    pub fn with_region_len(mut self, len: usize) -> Self {
        self.region_len = len;
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn threads(&self, instances: u32) -> usize {
        threads_per_instance(self.cpus, instances)
    }

    /// Run one engine instance with real threads
    pub fn run(&self, ctx: &WorkloadContext) -> ExitStatus {
        self.run_with(ctx, |_, name, stop, work| spawn_thread(name, stop, work))
    }

    /// Run one engine instance, creating workers through `spawn`.
    ///
    /// A transient spawn failure skips that worker; any other spawn failure
    /// stops the workers already running and fails the instance.
    pub fn run_with<S>(&self, ctx: &WorkloadContext, mut spawn: S) -> ExitStatus
    where
        S: FnMut(usize, String, RunControl, Workload) -> Result<ThreadWorker>,
    {
        debug!("{}: using method '{}'", ctx.name, self.method);

        let region = match MemoryRegion::with_len(self.region_len) {
            Ok(region) => Arc::new(region),
            Err(e) => {
                error!("{}: {}", ctx.name, e);
                return ExitStatus::NoResource;
            }
        };

        let stop = RunControl::new();
        let wanted = self.threads(ctx.instances);
        let mut workers = Vec::with_capacity(wanted);
        let mut status = ExitStatus::Success;

        for index in 0..wanted {
            let work = worker_loop(self.method, Arc::clone(&region), ctx.clone(), stop.clone());
            match spawn(index, format!("{}-{}", ctx.name, index), stop.clone(), work) {
                Ok(worker) => workers.push(worker),
                Err(StressError::Spawn {
                    transient: true,
                    message,
                }) => {
                    debug!("{}: skipping worker {}: {}", ctx.name, index, message);
                }
                Err(e) => {
                    error!("{}: {}", ctx.name, e);
                    status = ExitStatus::Failure;
                    break;
                }
            }
            if !ctx.run.keep_running() {
                break;
            }
        }

        if workers.is_empty() && status == ExitStatus::Success && ctx.run.keep_running() {
            warn!("{}: no worker threads could be started", ctx.name);
            status = ExitStatus::NoResource;
        }

        if status == ExitStatus::Success {
            while ctx.keep_stressing() && !workers.iter().all(ThreadWorker::is_finished) {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        stop.request_stop();
        for mut worker in workers {
            worker.terminate();
            match worker.join() {
                Ok(s) => status = status.worst(s),
                Err(e) => {
                    error!("{}: join: {}", ctx.name, e);
                    status = ExitStatus::Failure;
                }
            }
        }

        drop(region);
        status
    }
}

/// Body of one worker thread
fn worker_loop(
    method: Method,
    region: Arc<MemoryRegion>,
    ctx: WorkloadContext,
    stop: RunControl,
) -> Workload {
    Box::new(move || {
        let mut rng = StressRng::new();
        'run: while stop.keep_running() {
            for mem_size in scales() {
                if ctx.cap_reached() {
                    break 'run;
                }
                method.run(&region, mem_size, &mut rng, &stop);
                if !ctx.counter.inc_below(ctx.max_ops) {
                    break 'run;
                }
            }
        }
        ExitStatus::Success
    })
}
