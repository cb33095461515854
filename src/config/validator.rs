// Config validation
// Runs once before any instance starts and fails fast with actionable errors

use crate::config::types::{StressConfig, StressError, Result, MAX_INSTANCES};
use crate::stress::Stressor;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config at startup. Any error is fatal; warnings are returned.
pub fn validate_config(config: &StressConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_instances(config, &mut result);
    validate_run_limits(config, &mut result);

    match Stressor::from_name(&config.stressor) {
        Ok(stressor) => validate_stressor(stressor, config, &mut result),
        Err(e) => result.add_error(e.to_string()),
    }

    if !result.is_valid() {
        return Err(StressError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_instances(config: &StressConfig, result: &mut ValidationResult) {
    if config.instances == 0 {
        result.add_error("instances cannot be zero".to_string());
    }
    if config.instances > MAX_INSTANCES {
        result.add_error(format!(
            "instances {} exceeds the maximum of {}",
            config.instances, MAX_INSTANCES
        ));
    }
}

fn validate_run_limits(config: &StressConfig, result: &mut ValidationResult) {
    if config.ops == 0 && config.timeout.is_none() {
        result.add_warning(
            "neither ops nor timeout set, running until interrupted".to_string(),
        );
    }
    if let Some(name) = &config.name {
        if name.trim().is_empty() {
            result.add_error("name cannot be blank".to_string());
        }
    }
}

fn validate_stressor(stressor: Stressor, config: &StressConfig, result: &mut ValidationResult) {
    if let Err(e) = stressor.prepare(config) {
        result.add_error(e.to_string());
        return;
    }

    #[cfg(target_os = "linux")]
    match stressor {
        Stressor::Epoll => validate_epoll(config, result),
        Stressor::Memthrash => validate_memthrash(config, result),
        Stressor::Clock => {}
    }
}

#[cfg(target_os = "linux")]
fn validate_epoll(config: &StressConfig, result: &mut ValidationResult) {
    use crate::stress::epoll::domain::{check_port_range, SocketDomain};

    let Ok(domain) = SocketDomain::from_name(&config.epoll.domain) else {
        return;
    };
    if let Err(e) = check_port_range(config.epoll.port, domain, config.instances) {
        result.add_error(e.to_string());
    }
    if domain == SocketDomain::Unix {
        let dir = config.epoll.socket_dir();
        if !dir.is_dir() {
            result.add_error(format!("socket_dir does not exist: {:?}", dir));
        }
    }
}

#[cfg(target_os = "linux")]
fn validate_memthrash(config: &StressConfig, result: &mut ValidationResult) {
    if config.memthrash.cpus == Some(0) {
        result.add_warning("memthrash cpus 0 means the host processor count".to_string());
    }
    if config.instances > 1 {
        result.add_warning(format!(
            "{} memthrash instances each map 256 MiB",
            config.instances
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = StressConfig::default();
        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("until interrupted")));
    }

    #[test]
    fn test_zero_instances() {
        let config = StressConfig {
            instances: 0,
            ..StressConfig::default()
        };
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("instances cannot be zero"), "{}", err);
    }

    #[test]
    fn test_unknown_stressor() {
        let config = StressConfig {
            stressor: "vm".to_string(),
            ..StressConfig::default()
        };
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("unknown stressor 'vm'"), "{}", err);
    }

    #[test]
    fn test_port_headroom_scales_with_instances() {
        let mut config = StressConfig {
            instances: 100,
            ..StressConfig::default()
        };
        config.epoll.domain = "ipv4".to_string();
        config.epoll.port = 65535 - 399;
        assert!(validate_config(&config).is_err());

        config.epoll.port = 65535 - 400;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_unknown_domain_and_method() {
        let mut config = StressConfig::default();
        config.epoll.domain = "tipc".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = StressConfig {
            stressor: "memthrash".to_string(),
            ops: 1,
            ..StressConfig::default()
        };
        config.memthrash.method = "bogus".to_string();
        let err = validate_config(&config).unwrap_err().to_string();
        assert!(err.contains("memthrash-method must be one of"), "{}", err);
    }

    #[test]
    fn test_other_stressor_options_are_ignored() {
        let mut config = StressConfig {
            stressor: "clock".to_string(),
            ops: 10,
            ..StressConfig::default()
        };
        config.epoll.domain = "tipc".to_string();
        let result = validate_config(&config).unwrap();
        assert!(result.warnings.is_empty());
    }
}
