//! End-to-end runs through the public entry point
//!
//! Each test goes through validation, forks real instances and folds their
//! reports, exactly as the command line does. They share the process-wide
//! signal flag, so they run one at a time.

use serial_test::serial;
use stressbox::{run, ExitStatus, StressConfig};
use std::time::Duration;

#[test]
#[serial]
fn unix_epoll_run_counts_every_instance_and_leaves_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StressConfig {
        stressor: "epoll".to_string(),
        instances: 2,
        ops: 30,
        ..StressConfig::default()
    };
    config.epoll.domain = "unix".to_string();
    config.epoll.socket_dir = Some(dir.path().to_path_buf());

    let summary = run(config).unwrap();

    assert_eq!(summary.status, ExitStatus::Success);
    assert_eq!(summary.reports.len(), 2);
    assert!(summary.reports.iter().all(|r| r.bogo_ops == 30));
    assert_eq!(summary.bogo_ops, 60);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "socket files left behind: {:?}", leftovers);
}

#[test]
#[serial]
fn memthrash_run_stops_at_timeout() {
    let mut config = StressConfig {
        stressor: "memthrash".to_string(),
        timeout: Some(Duration::from_millis(500)),
        ..StressConfig::default()
    };
    config.memthrash.method = "chunk64".to_string();
    config.memthrash.cpus = Some(2);

    let summary = run(config).unwrap();

    assert_eq!(summary.status, ExitStatus::Success);
    assert!(summary.bogo_ops > 0);
    assert!(summary.elapsed < Duration::from_secs(5), "{:?}", summary.elapsed);
}

#[test]
#[serial]
fn port_range_overflow_is_rejected_before_spawning() {
    let mut config = StressConfig {
        stressor: "epoll".to_string(),
        instances: 8,
        ops: 1,
        ..StressConfig::default()
    };
    config.epoll.domain = "ipv6".to_string();
    config.epoll.port = 65530;

    let err = run(config).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::Failure);
}

#[test]
#[serial]
fn unknown_memthrash_method_lists_the_catalogue() {
    let mut config = StressConfig {
        stressor: "memthrash".to_string(),
        ops: 1,
        ..StressConfig::default()
    };
    config.memthrash.method = "zigzag".to_string();

    let err = run(config).unwrap_err().to_string();
    assert!(err.contains("chunk1"), "{}", err);
    assert!(err.contains("spinwrite"), "{}", err);
}
