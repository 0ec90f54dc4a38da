//! Engine configuration, loaded from a JSON file.
//!
//! Every field has a default, so `{}` is a valid config. CLI flags with
//! environment fallbacks override individual values in the binary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::{Backoff, NodeInventory};
use crate::error::ConfigError;
use crate::executor::{ExecutorSettings, LockFile};
use crate::prometheus::PrometheusConfig;
use crate::selector::SelectorSettings;

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutohealConfig {
    pub remediation: RemediationConfig,
    pub lock: LockConfig,
    pub executor: ExecutorConfig,
    /// Node id to agent base URL
    pub nodes: BTreeMap<String, String>,
    pub telemetry: TelemetryConfig,
    pub audit: AuditConfig,
    pub server: ServerConfig,
}

/// Retry loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationConfig {
    /// Maximum attempts per action before it is marked fatal
    pub max_attempts: u32,
    /// Budget for one attempt, including the transport round trip
    pub attempt_timeout_secs: u64,
    /// Request timeout of the HTTP transport to node agents
    pub transport_timeout_secs: u64,
    pub backoff: Backoff,
    /// When false, decisions are recorded but nothing is executed
    pub auto_healing_enabled: bool,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_secs: 300,
            transport_timeout_secs: 240,
            backoff: Backoff::Fixed,
            auto_healing_enabled: true,
        }
    }
}

/// Node execution lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub path: PathBuf,
    /// Age after which a lock is considered abandoned; below the attempt timeout
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/autoheal/heal.lock"),
            ttl_secs: 240,
        }
    }
}

/// Node-side action tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub step_timeout_secs: u64,
    pub log_dir: PathBuf,
    pub log_max_age_days: u32,
    pub temp_dirs: Vec<PathBuf>,
    pub diagnostics_lines: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let defaults = ExecutorSettings::default();
        Self {
            step_timeout_secs: defaults.step_timeout.as_secs(),
            log_dir: defaults.log_dir,
            log_max_age_days: defaults.log_max_age_days,
            temp_dirs: defaults.temp_dirs,
            diagnostics_lines: defaults.diagnostics_lines,
        }
    }
}

/// Metrics lookup for the CPU refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Prometheus base URL; telemetry refinement is off when unset
    pub prometheus_url: Option<String>,
    /// Label carrying the node id on node-exporter series
    pub node_label: String,
    pub cpu_sustain_window_mins: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_url: None,
            node_label: "instance".to_string(),
            cpu_sustain_window_mins: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/autoheal/audit.jsonl"),
        }
    }
}

/// Listen addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Orchestrator listen address
    pub listen: String,
    /// Node agent listen address
    pub agent_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            agent_listen: "0.0.0.0:8081".to_string(),
        }
    }
}

impl AutohealConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Check constraints between values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.remediation;
        if r.max_attempts < 1 {
            return Err(ConfigError::Invalid("remediation.max_attempts must be >= 1".into()));
        }
        if r.attempt_timeout_secs == 0 {
            return Err(ConfigError::Invalid("remediation.attempt_timeout_secs must be > 0".into()));
        }
        if r.attempt_timeout_secs < r.transport_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "remediation.attempt_timeout_secs ({}) must be >= transport_timeout_secs ({})",
                r.attempt_timeout_secs, r.transport_timeout_secs
            )));
        }
        if self.lock.ttl_secs == 0 {
            return Err(ConfigError::Invalid("lock.ttl_secs must be > 0".into()));
        }
        // A lock left by a timed-out attempt must be stale by the next retry.
        if self.lock.ttl_secs >= r.attempt_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "lock.ttl_secs ({}) must be < remediation.attempt_timeout_secs ({})",
                self.lock.ttl_secs, r.attempt_timeout_secs
            )));
        }
        if self.executor.step_timeout_secs == 0 {
            return Err(ConfigError::Invalid("executor.step_timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation.attempt_timeout_secs)
    }

    #[must_use]
    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.remediation.transport_timeout_secs)
    }

    #[must_use]
    pub fn selector_settings(&self) -> SelectorSettings {
        SelectorSettings {
            max_attempts: self.remediation.max_attempts,
            attempt_timeout: self.attempt_timeout(),
            cpu_sustain_window: Duration::from_secs(self.telemetry.cpu_sustain_window_mins * 60),
        }
    }

    #[must_use]
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            step_timeout: Duration::from_secs(self.executor.step_timeout_secs),
            log_dir: self.executor.log_dir.clone(),
            log_max_age_days: self.executor.log_max_age_days,
            temp_dirs: self.executor.temp_dirs.clone(),
            diagnostics_lines: self.executor.diagnostics_lines,
        }
    }

    #[must_use]
    pub fn lock_file(&self) -> LockFile {
        LockFile::new(&self.lock.path, Duration::from_secs(self.lock.ttl_secs))
    }

    #[must_use]
    pub fn inventory(&self) -> NodeInventory {
        NodeInventory::new(self.nodes.clone())
    }

    /// Prometheus client settings, if telemetry is configured.
    #[must_use]
    pub fn prometheus(&self) -> Option<PrometheusConfig> {
        self.telemetry.prometheus_url.as_ref().map(|url| PrometheusConfig {
            base_url: url.clone(),
            node_label: self.telemetry.node_label.clone(),
            ..PrometheusConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_is_all_defaults() {
        let config: AutohealConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AutohealConfig::default());
        assert_eq!(config.remediation.max_attempts, 3);
        assert_eq!(config.lock.ttl_secs, 240);
        assert_eq!(config.executor.temp_dirs, vec![PathBuf::from("/tmp")]);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "remediation": {{"max_attempts": 5, "backoff": "exponential"}},
                "nodes": {{"n1": "http://10.0.0.1:8081"}},
                "telemetry": {{"prometheus_url": "http://prom:9090"}}
            }}"#
        )
        .unwrap();

        let config = AutohealConfig::load(file.path()).unwrap();
        assert_eq!(config.remediation.max_attempts, 5);
        assert_eq!(config.remediation.backoff, Backoff::Exponential);
        assert_eq!(config.remediation.attempt_timeout_secs, 300);
        assert_eq!(config.inventory().resolve("n1").unwrap(), "http://10.0.0.1:8081");
        assert_eq!(config.prometheus().unwrap().base_url, "http://prom:9090");
        assert_eq!(config.selector_settings().max_attempts, 5);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = AutohealConfig::default();
        config.remediation.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AutohealConfig::default();
        config.remediation.transport_timeout_secs = 600;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AutohealConfig::default();
        config.lock.ttl_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_lock_ttl_must_stay_below_attempt_timeout() {
        let mut config = AutohealConfig::default();
        config.lock.ttl_secs = config.remediation.attempt_timeout_secs;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("lock.ttl_secs (300)"), "{err}");

        config.lock.ttl_secs = 600;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.lock.ttl_secs = config.remediation.attempt_timeout_secs - 1;
        config.validate().unwrap();
    }

    #[test]
    fn test_unreadable_and_unparseable() {
        let err = AutohealConfig::load("/nonexistent/autoheal.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = AutohealConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
