use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use disk_tunnel_runner::prelude::{PolicyOverrides, RunnerConfig};
use disk_tunnel_summary_model::ReconcilePolicy;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Configuration file is not valid TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Controller configuration. Every field has a default so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub admission: AdmissionConfig,
    pub state: StateConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7878)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to fio. `DT_FIO_PATH` takes precedence, `PATH` is searched when neither is set.
    pub path: Option<PathBuf>,
    pub timeout_margin_secs: u64,
    pub stop_grace_secs: u64,
    pub launch_grace_secs: u64,
    pub progress_interval_ms: u64,
    pub output_tail_bytes: usize,
    pub ioengine: Option<String>,
    pub direct_io: Option<bool>,
    pub thread_mode: Option<bool>,
    pub keep_test_file: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        Self {
            path: None,
            timeout_margin_secs: runner.timeout_margin.as_secs(),
            stop_grace_secs: runner.stop_grace.as_secs(),
            launch_grace_secs: runner.launch_grace.as_secs(),
            progress_interval_ms: runner.progress_interval.as_millis() as u64,
            output_tail_bytes: runner.output_tail_bytes,
            ioengine: None,
            direct_io: None,
            thread_mode: None,
            keep_test_file: false,
        }
    }
}

impl EngineConfig {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            engine_path: self.path.clone(),
            timeout_margin: Duration::from_secs(self.timeout_margin_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            launch_grace: Duration::from_secs(self.launch_grace_secs),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            output_tail_bytes: self.output_tail_bytes,
            policy_overrides: PolicyOverrides {
                ioengine: self.ioengine.clone(),
                direct_io: self.direct_io,
                thread_mode: self.thread_mode,
            },
            keep_test_file: self.keep_test_file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionConfig {
    pub min_size_bytes: u64,
    pub max_size_bytes: u64,
    /// Refuse runs whose test file would not fit on the target disk.
    pub check_free_space: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_size_bytes: 64 * 1024 * 1024,
            max_size_bytes: 256 * 1024 * 1024 * 1024,
            check_free_space: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    /// The durable state file.
    pub path: PathBuf,
    /// Finished runs are appended here as JSON lines when set.
    pub history_path: Option<PathBuf>,
    /// Finished runs kept in memory and in the state file.
    pub retention: usize,
    /// Minimum time between state file writes caused by progress alone.
    pub persist_interval_secs: u64,
    /// What happens to runs found active in the state file at startup.
    pub reconcile: ReconcilePolicy,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("disk-tunnel-state.json"),
            history_path: None,
            retention: 50,
            persist_interval_secs: 5,
            reconcile: ReconcilePolicy::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    /// Workload catalog to use instead of the built-in one.
    pub workloads_path: Option<PathBuf>,
    /// Threshold table to use instead of the built-in one.
    pub thresholds_path: Option<PathBuf>,
}

impl Config {
    /// Load the configuration file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.min_size_bytes > self.admission.max_size_bytes {
            return Err(ConfigError::Invalid(format!(
                "admission.min_size_bytes ({}) is greater than admission.max_size_bytes ({})",
                self.admission.min_size_bytes, self.admission.max_size_bytes
            )));
        }
        if self.state.retention == 0 {
            return Err(ConfigError::Invalid(
                "state.retention must be at least 1".to_string(),
            ));
        }
        if self.engine.progress_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "engine.progress_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.engine.output_tail_bytes == 0 {
            return Err(ConfigError::Invalid(
                "engine.output_tail_bytes must be greater than 0".to_string(),
            ));
        }
        if self.engine.launch_grace_secs == 0 {
            return Err(ConfigError::Invalid(
                "engine.launch_grace_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.listen.port(), 7878);
        assert_eq!(config.state.reconcile, ReconcilePolicy::Failed);
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
[server]
listen = "0.0.0.0:9000"

[engine]
path = "/opt/fio/bin/fio"
timeout_margin_secs = 30
thread_mode = true

[admission]
min_size_bytes = 1024
check_free_space = false

[state]
path = "/var/lib/disk-tunnel/state.json"
history_path = "/var/lib/disk-tunnel/history.jsonl"
retention = 5
reconcile = "stopped"
"#,
        )
        .unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.engine.path, Some(PathBuf::from("/opt/fio/bin/fio")));
        assert_eq!(config.engine.stop_grace_secs, 10);
        assert_eq!(config.admission.min_size_bytes, 1024);
        assert!(!config.admission.check_free_space);
        assert_eq!(config.state.retention, 5);
        assert_eq!(config.state.reconcile, ReconcilePolicy::Stopped);

        let runner = config.engine.runner_config();
        assert_eq!(runner.timeout_margin, Duration::from_secs(30));
        assert_eq!(runner.policy_overrides.thread_mode, Some(true));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("[engine]\ntimeout = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn inverted_size_bounds_are_invalid() {
        let mut config = Config::default();
        config.admission.min_size_bytes = 10;
        config.admission.max_size_bytes = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_retention_is_invalid() {
        let mut config = Config::default();
        config.state.retention = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::load(Some(Path::new("/nonexistent/disk-tunnel.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }
}
