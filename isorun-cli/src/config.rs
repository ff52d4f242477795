//! Configuration loading from isorun.toml
//!
//! Executor settings can be specified in an `isorun.toml` file in the project root.
//! The configuration is automatically discovered by walking up from the current directory.
//! Command-line flags override file values.

use crate::executor::{ExecutorConfig, Policy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the configuration file searched for by [`FileConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "isorun.toml";

/// isorun configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    /// Executor configuration
    #[serde(default)]
    pub executor: ExecutorSection,
    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

/// Isolation mode for task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Run each task in a forked worker process (default)
    #[default]
    Process,
    /// Run tasks synchronously in the caller (no isolation, no deadline)
    InProcess,
}

impl IsolationMode {
    /// Whether this mode provides process isolation
    pub fn is_isolated(self) -> bool {
        matches!(self, IsolationMode::Process)
    }
}

/// Submission policy as written in the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    /// Supervise tasks on background threads
    #[default]
    Pooled,
    /// Run one task at a time on the submitting thread
    SingleFlight,
}

/// `[executor]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Wall-clock budget for a single task (e.g., "10s", "500ms")
    #[serde(default = "default_timeout")]
    pub timeout: String,
    /// Submission policy: "pooled" or "single-flight"
    #[serde(default)]
    pub policy: PolicyKind,
    /// Supervisor threads for the pooled policy (unset = one thread per task)
    #[serde(default)]
    pub pool_size: Option<usize>,
    /// Isolation mode: "process" or "in-process"
    #[serde(default)]
    pub isolation: IsolationMode,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            policy: PolicyKind::default(),
            pool_size: None,
            isolation: IsolationMode::default(),
        }
    }
}

fn default_timeout() -> String {
    "10s".to_string()
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Default output format: "human" or "json"
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
        }
    }
}

fn default_format() -> String {
    "human".to_string()
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return match Self::load(&config_path) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        tracing::warn!(
                            path = %config_path.display(),
                            error = %e,
                            "ignoring unreadable config"
                        );
                        None
                    }
                };
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Build the executor configuration described by the `[executor]` table
    pub fn executor_config(&self) -> anyhow::Result<ExecutorConfig> {
        let section = &self.executor;
        let timeout = parse_duration(&section.timeout)?;
        if timeout.is_zero() {
            anyhow::bail!("executor.timeout must be greater than zero");
        }
        if section.pool_size == Some(0) {
            anyhow::bail!("executor.pool_size must be at least 1");
        }

        let policy = match section.policy {
            PolicyKind::Pooled => Policy::Pooled {
                pool_size: section.pool_size,
            },
            PolicyKind::SingleFlight => Policy::SingleFlight,
        };

        Ok(ExecutorConfig {
            timeout,
            policy,
            isolation: section.isolation,
        })
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# isorun configuration

[executor]
# Wall-clock budget for a single task; overrunning workers are killed
timeout = "10s"
# Submission policy: "pooled" or "single-flight"
policy = "pooled"
# Supervisor threads for the pooled policy (uncomment to enable)
# pool_size = 4
# Isolation mode: "process" or "in-process"
isolation = "process"

[output]
# Default output format: human or json
format = "human"
"#
        .to_string()
    }
}

/// Parse duration string (e.g., "3s", "500ms", "2m"). A bare number is seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::anyhow!("Empty duration string"));
    }

    // Find where the number ends and unit begins
    let (num_part, unit_part) = s
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(i, _)| s.split_at(i))
        .unwrap_or((s, "s"));

    let value: f64 = num_part
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
    if !value.is_finite() || value < 0.0 {
        return Err(anyhow::anyhow!("Invalid duration: {}", s));
    }

    let multiplier: f64 = match unit_part.to_lowercase().as_str() {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" | "sec" => 1e9,
        "m" | "min" => 60e9,
        _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
    };

    Ok(Duration::from_nanos((value * multiplier) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FileConfig::default();
        assert_eq!(config.executor.timeout, "10s");
        assert_eq!(config.executor.policy, PolicyKind::Pooled);
        assert!(config.executor.isolation.is_isolated());
        assert_eq!(config.output.format, "human");
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(parse_duration("1000ns").unwrap(), Duration::from_nanos(1000));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("3 parsecs").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [executor]
            timeout = "250ms"
            policy = "single-flight"
            isolation = "in-process"
        "#;

        let config: FileConfig = toml::from_str(toml_str).unwrap();
        let executor = config.executor_config().unwrap();
        assert_eq!(executor.timeout, Duration::from_millis(250));
        assert_eq!(executor.policy, Policy::SingleFlight);
        assert_eq!(executor.isolation, IsolationMode::InProcess);
        // Defaults should still apply
        assert_eq!(config.output.format, "human");
    }

    #[test]
    fn test_pool_size_maps_to_pooled_policy() {
        let config: FileConfig = toml::from_str("[executor]\npool_size = 3\n").unwrap();
        assert_eq!(
            config.executor_config().unwrap().policy,
            Policy::Pooled { pool_size: Some(3) }
        );
    }

    #[test]
    fn test_invalid_executor_values() {
        let zero: FileConfig = toml::from_str("[executor]\ntimeout = \"0s\"\n").unwrap();
        assert!(zero.executor_config().is_err());

        let empty_pool: FileConfig = toml::from_str("[executor]\npool_size = 0\n").unwrap();
        assert!(empty_pool.executor_config().is_err());

        assert!(toml::from_str::<FileConfig>("[executor]\npolicy = \"eager\"\n").is_err());
    }

    #[test]
    fn test_default_toml_parses() {
        let default_toml = FileConfig::default_toml();
        let config: FileConfig = toml::from_str(&default_toml).unwrap();
        assert_eq!(config.executor.timeout, "10s");
        assert_eq!(
            config.executor_config().unwrap().policy,
            Policy::Pooled { pool_size: None }
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[output]\nformat = \"json\"\n").unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.output.format, "json");
        assert_eq!(config.executor.timeout, "10s");
    }
}
