//! Integration tests for the memthrash stressor
//!
//! A small region keeps these fast; the thread pool, the shared cap and
//! worker spawn failures behave the same at any region size.

use stressbox::config::types::{MemthrashOptions, StressError};
use stressbox::core::spawner::spawn_thread;
use stressbox::core::types::{ExitStatus, WorkloadContext};
use stressbox::stress::memthrash::methods::{Method, MemoryRegion};
use stressbox::stress::memthrash::MemthrashEngine;
use stressbox::utils::rng::StressRng;
use stressbox::core::run_control::RunControl;
use std::time::{Duration, Instant};

const REGION: usize = 1 << 16;

fn engine(method: &str, cpus: usize) -> MemthrashEngine {
    let options = MemthrashOptions {
        method: method.to_string(),
        cpus: Some(cpus),
    };
    MemthrashEngine::new(&options).unwrap().with_region_len(REGION)
}

#[test]
fn shared_cap_holds_across_worker_threads() {
    let engine = engine("chunkpage", 4);
    assert_eq!(engine.threads(1), 4);

    let ctx = WorkloadContext::new("memthrash", 0, 100).unwrap();
    assert_eq!(engine.run(&ctx), ExitStatus::Success);
    assert_eq!(ctx.bogo_ops(), 100);
}

#[test]
fn uncapped_run_stops_promptly_when_cancelled() {
    let engine = engine("all", 2);
    let ctx = WorkloadContext::new("memthrash", 0, 0).unwrap();

    let stopper = ctx.run.clone();
    let timer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        let requested = Instant::now();
        stopper.request_stop();
        requested
    });

    assert_eq!(engine.run(&ctx), ExitStatus::Success);
    let returned = Instant::now();
    let requested = timer.join().unwrap();

    // One supervisor poll plus one bounded method pass, workers joined.
    let latency = returned.saturating_duration_since(requested);
    assert!(latency <= Duration::from_millis(200), "stop took {:?}", latency);
    assert!(ctx.bogo_ops() > 0);
}

#[test]
fn transient_spawn_failure_skips_one_worker() {
    let engine = engine("chunk1", 3);
    let ctx = WorkloadContext::new("memthrash", 0, 30).unwrap();

    let status = engine.run_with(&ctx, |index, name, stop, work| {
        if index == 1 {
            return Err(StressError::Spawn {
                transient: true,
                message: "resource temporarily unavailable".to_string(),
            });
        }
        spawn_thread(name, stop, work)
    });

    assert_eq!(status, ExitStatus::Success);
    assert_eq!(ctx.bogo_ops(), 30);
}

#[test]
fn hard_spawn_failure_fails_the_instance() {
    let engine = engine("chunk1", 3);
    let ctx = WorkloadContext::new("memthrash", 0, 0).unwrap();

    let status = engine.run_with(&ctx, |index, name, stop, work| {
        if index == 2 {
            return Err(StressError::Spawn {
                transient: false,
                message: "invalid argument".to_string(),
            });
        }
        spawn_thread(name, stop, work)
    });

    assert_eq!(status, ExitStatus::Failure);
}

#[test]
fn no_workers_at_all_is_a_resource_shortage() {
    let engine = engine("chunk1", 2);
    let ctx = WorkloadContext::new("memthrash", 0, 10).unwrap();

    let status = engine.run_with(&ctx, |_, _, _, _| {
        Err(StressError::Spawn {
            transient: true,
            message: "resource temporarily unavailable".to_string(),
        })
    });

    assert_eq!(status, ExitStatus::NoResource);
    assert_eq!(ctx.bogo_ops(), 0);
}

#[test]
fn every_concrete_method_completes_a_pass() {
    let region = MemoryRegion::with_len(REGION).unwrap();
    let stop = RunControl::new();
    let mut rng = StressRng::seeded(7);

    for method in Method::concrete() {
        let start = Instant::now();
        method.run(&region, REGION, &mut rng, &stop);
        assert!(
            start.elapsed() < Duration::from_secs(2),
            "{} took {:?}",
            method,
            start.elapsed()
        );
    }
}
