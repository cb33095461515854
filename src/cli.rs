use crate::config::types::{ExitStatus, StressConfig};
use crate::core::runner::{self, RunSummary};
use crate::stress::Stressor;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Network and memory subsystem stressors", long_about = None)]
struct Cli {
    /// Debug-level diagnostics (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

/// Settings shared by every stressor
#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// JSON config file; flags given here override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Number of concurrently running instances
    #[arg(short = 'n', long)]
    instances: Option<u32>,
    /// Stop each instance after N bogo operations (0 = unbounded)
    #[arg(long)]
    ops: Option<u64>,
    /// Stop the run after this many seconds
    #[arg(short, long)]
    timeout: Option<f64>,
    /// Diagnostic name used as log prefix
    #[arg(long)]
    name: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect/accept/read cycles through edge-triggered epoll servers
    Epoll {
        #[command(flatten)]
        run: RunArgs,
        /// Base listening port
        #[arg(long)]
        port: Option<u16>,
        /// Socket domain: ipv4, ipv6 or unix
        #[arg(long)]
        domain: Option<String>,
        /// Directory for unix-domain socket files
        #[arg(long, value_name = "DIR")]
        socket_dir: Option<PathBuf>,
    },
    /// Multi-threaded cache and memory thrashing
    Memthrash {
        #[command(flatten)]
        run: RunArgs,
        /// Access pattern (see `list`)
        #[arg(long)]
        method: Option<String>,
        /// Processor count used to size the worker pool
        #[arg(long)]
        cpus: Option<usize>,
    },
    /// Clock and POSIX timer system calls
    Clock {
        #[command(flatten)]
        run: RunArgs,
    },
    /// List stressors, socket domains and memory methods
    List,
}

fn base_config(stressor: Stressor, run: &RunArgs) -> Result<StressConfig> {
    let mut config = match &run.config {
        Some(path) => StressConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StressConfig::default(),
    };
    config.stressor = stressor.name().to_string();
    if let Some(instances) = run.instances {
        config.instances = instances;
    }
    if let Some(ops) = run.ops {
        config.ops = ops;
    }
    if let Some(secs) = run.timeout {
        if !secs.is_finite() || secs <= 0.0 {
            anyhow::bail!("--timeout must be a positive number of seconds");
        }
        config.timeout = Some(Duration::from_secs_f64(secs));
    }
    if let Some(name) = &run.name {
        config.name = Some(name.clone());
    }
    Ok(config)
}

/// Turn a stressor subcommand into a full run configuration
fn build_config(command: Commands) -> Result<Option<StressConfig>> {
    let config = match command {
        Commands::Epoll {
            run,
            port,
            domain,
            socket_dir,
        } => {
            let mut config = base_config(Stressor::Epoll, &run)?;
            if let Some(port) = port {
                config.epoll.port = port;
            }
            if let Some(domain) = domain {
                config.epoll.domain = domain;
            }
            if socket_dir.is_some() {
                config.epoll.socket_dir = socket_dir;
            }
            config
        }
        Commands::Memthrash { run, method, cpus } => {
            let mut config = base_config(Stressor::Memthrash, &run)?;
            if let Some(method) = method {
                config.memthrash.method = method;
            }
            if cpus.is_some() {
                config.memthrash.cpus = cpus;
            }
            config
        }
        Commands::Clock { run } => base_config(Stressor::Clock, &run)?,
        Commands::List => return Ok(None),
    };
    Ok(Some(config))
}

fn print_list() {
    println!("stressors:");
    for stressor in Stressor::all() {
        println!("  {:<10} {}", stressor.name(), stressor.description());
    }

    #[cfg(target_os = "linux")]
    {
        use crate::stress::epoll::domain::SocketDomain;
        use crate::stress::memthrash::methods::{Method, CATALOGUE};

        let domains: Vec<&str> = SocketDomain::ALL.iter().map(|d| d.name()).collect();
        println!("epoll domains: {}", domains.join(" "));
        println!("memthrash methods:");
        for method in CATALOGUE {
            match method.alias() {
                Some(alias) => println!("  {:<10} ({})", method.name(), alias),
                None => println!("  {}", method.name()),
            }
        }
        println!("default memthrash method: {}", Method::default_method());
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!(
        "{}: {} bogo ops in {:.2}s ({:.2} ops/s) over {} instance(s), {}",
        summary.stressor,
        summary.bogo_ops,
        summary.elapsed.as_secs_f64(),
        summary.ops_per_sec(),
        summary.instances,
        summary.status
    );
    for report in &summary.reports {
        println!(
            "  instance {:>3} (pid {}): {} bogo ops, {}",
            report.instance, report.pid, report.bogo_ops, report.status
        );
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Platform compatibility check - engines use Linux-only interfaces
    if !cfg!(target_os = "linux") {
        eprintln!("Warning: stressors are not implemented on this platform and will be skipped");
    }

    let Some(config) = build_config(cli.command)? else {
        print_list();
        return Ok(());
    };

    let summary = runner::run(config)?;
    print_summary(&summary, cli.json)?;

    if summary.status != ExitStatus::Success {
        std::process::exit(summary.status.code());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(args: &[&str]) -> Option<StressConfig> {
        let cli = Cli::try_parse_from(args).unwrap();
        build_config(cli.command).unwrap()
    }

    #[test]
    fn epoll_flags_override_defaults() {
        let config = config_from(&[
            "stressbox", "epoll", "--instances", "3", "--ops", "50", "--domain", "ipv6", "--port",
            "7000",
        ])
        .unwrap();
        assert_eq!(config.stressor, "epoll");
        assert_eq!(config.instances, 3);
        assert_eq!(config.ops, 50);
        assert_eq!(config.epoll.domain, "ipv6");
        assert_eq!(config.epoll.port, 7000);
    }

    #[test]
    fn memthrash_method_and_timeout() {
        let config = config_from(&[
            "stressbox", "memthrash", "--method", "full-fill", "-t", "1.5", "--cpus", "2",
        ])
        .unwrap();
        assert_eq!(config.memthrash.method, "full-fill");
        assert_eq!(config.memthrash.cpus, Some(2));
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stress.json");
        std::fs::write(&path, r#"{"instances": 4, "ops": 9, "name": "nightly"}"#).unwrap();

        let config = config_from(&[
            "stressbox",
            "clock",
            "--config",
            path.to_str().unwrap(),
            "--ops",
            "2",
        ])
        .unwrap();
        assert_eq!(config.stressor, "clock");
        assert_eq!(config.instances, 4);
        assert_eq!(config.ops, 2);
        assert_eq!(config.diagnostic_name(), "nightly");
    }

    #[test]
    fn list_builds_no_config() {
        assert!(config_from(&["stressbox", "list"]).is_none());
    }

    #[test]
    fn non_positive_timeout_is_rejected() {
        let cli = Cli::try_parse_from(["stressbox", "clock", "--timeout", "0"]).unwrap();
        assert!(build_config(cli.command).is_err());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["stressbox", "clock", "--json", "-v"]).unwrap();
        assert!(cli.json);
        assert!(cli.verbose);
    }
}
