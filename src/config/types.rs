/// Core types and structures for the stressbox system
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Lowest base port accepted for socket stressors
pub const MIN_STRESS_PORT: u16 = 1024;

/// Highest port any socket stressor may listen on
pub const MAX_STRESS_PORT: u16 = 65535;

/// Default base port for the epoll stressor
pub const DEFAULT_EPOLL_PORT: u16 = 6000;

/// Upper bound on concurrently running engine instances
pub const MAX_INSTANCES: u32 = 4096;

/// Terminal status of one engine instance, doubling as its process exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Ran to cancellation or cap
    Success,
    /// Setup failed or retries were exhausted
    Failure,
    /// Could not obtain a resource (mapping, workers)
    NoResource,
    /// Platform lacks the required capability; treated as a skip
    NotImplemented,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::NoResource => 3,
            Self::NotImplemented => 4,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            3 => Self::NoResource,
            4 => Self::NotImplemented,
            _ => Self::Failure,
        }
    }

    /// Severity used when folding many instance statuses into one
    fn severity(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::NotImplemented => 1,
            Self::NoResource => 2,
            Self::Failure => 3,
        }
    }

    /// The worse of two statuses
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NoResource => "no-resource",
            Self::NotImplemented => "not-implemented",
        };
        f.write_str(s)
    }
}

/// Options for the epoll socket stressor
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EpollOptions {
    /// Base port; instance `i` uses `port + i * servers ..`
    pub port: u16,
    /// Socket domain name: ipv4, ipv6 or unix
    pub domain: String,
    /// Directory for unix-domain socket files (system temp dir when unset)
    pub socket_dir: Option<PathBuf>,
}

impl Default for EpollOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_EPOLL_PORT,
            domain: "unix".to_string(),
            socket_dir: None,
        }
    }
}

impl EpollOptions {
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Options for the memthrash stressor
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemthrashOptions {
    /// Access pattern name
    pub method: String,
    /// Processor count override; queried from the host when unset
    pub cpus: Option<usize>,
}

impl Default for MemthrashOptions {
    fn default() -> Self {
        Self {
            method: "chunk1".to_string(),
            cpus: None,
        }
    }
}

impl MemthrashOptions {
    pub fn cpus(&self) -> usize {
        self.cpus
            .filter(|&n| n > 0)
            .unwrap_or_else(crate::utils::cpu::processors_configured)
    }
}

/// Full stressor run configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    /// Stressor name: epoll, memthrash or clock
    pub stressor: String,
    /// Number of concurrently running engine instances
    pub instances: u32,
    /// Soft operation cap per instance (0 = unbounded)
    pub ops: u64,
    /// Wall-clock run limit; runs until a shutdown signal when unset
    #[serde(with = "optional_secs")]
    pub timeout: Option<Duration>,
    /// Diagnostic name prefix; defaults to the stressor name
    pub name: Option<String>,
    pub epoll: EpollOptions,
    pub memthrash: MemthrashOptions,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            stressor: "epoll".to_string(),
            instances: 1,
            ops: 0,
            timeout: None,
            name: None,
            epoll: EpollOptions::default(),
            memthrash: MemthrashOptions::default(),
        }
    }
}

impl StressConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StressError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| StressError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Diagnostic name used as the log prefix
    pub fn diagnostic_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.stressor.clone())
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s > 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }
}

/// Error types for stressbox operations
#[derive(Error, Debug)]
pub enum StressError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Worker spawn failed: {message}")]
    Spawn { message: String, transient: bool },

    #[error("Gave up after {attempts} consecutive connect failures")]
    RetryExhausted { attempts: u32 },

    #[error("Not implemented on this platform: {0}")]
    NotImplemented(String),

    #[error("Resource exhausted: {0}")]
    Resource(String),
}

impl StressError {
    pub fn setup(what: &str, err: impl std::fmt::Display) -> Self {
        Self::Setup(format!("{what}: {err}"))
    }

    /// Terminal status an instance reports when it stops on this error
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::NotImplemented(_) => ExitStatus::NotImplemented,
            Self::Resource(_) => ExitStatus::NoResource,
            _ => ExitStatus::Failure,
        }
    }
}

impl From<nix::errno::Errno> for StressError {
    fn from(errno: nix::errno::Errno) -> Self {
        StressError::Io(std::io::Error::from(errno))
    }
}

pub type Result<T> = std::result::Result<T, StressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_codes_round_trip() {
        for status in [
            ExitStatus::Success,
            ExitStatus::Failure,
            ExitStatus::NoResource,
            ExitStatus::NotImplemented,
        ] {
            assert_eq!(ExitStatus::from_code(status.code()), status);
        }
        assert_eq!(ExitStatus::from_code(137), ExitStatus::Failure);
    }

    #[test]
    fn worst_status_prefers_failures_over_skips() {
        assert_eq!(
            ExitStatus::Success.worst(ExitStatus::NotImplemented),
            ExitStatus::NotImplemented
        );
        assert_eq!(
            ExitStatus::Failure.worst(ExitStatus::NoResource),
            ExitStatus::Failure
        );
    }

    #[test]
    fn config_json_fills_defaults() {
        let config: StressConfig =
            serde_json::from_str(r#"{"stressor":"memthrash","ops":5,"timeout":2.5}"#).unwrap();
        assert_eq!(config.stressor, "memthrash");
        assert_eq!(config.instances, 1);
        assert_eq!(config.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.epoll.port, DEFAULT_EPOLL_PORT);
        assert_eq!(config.memthrash.method, "chunk1");
        assert_eq!(config.diagnostic_name(), "memthrash");
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stress.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = StressConfig::load_from_file(&path).unwrap_err();
        assert!(matches!(err, StressError::Config(_)));
    }
}
