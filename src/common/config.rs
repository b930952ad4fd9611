//! Configuration file handling

use serde::Deserialize;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// How assemblies are isolated and executed
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Agent pool settings
    #[serde(default)]
    pub agency: AgencyConfig,

    /// Assembly change watching
    #[serde(default)]
    pub watch: WatchConfig,

    /// Result output settings
    #[serde(default)]
    pub output: OutputConfig,
}

/// Where each assembly runs
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// In-process isolated context (worker thread) per assembly
    #[default]
    Context,
    /// Leased agent process per assembly
    Process,
}

impl std::str::FromStr for Isolation {
    type Err = super::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "context" => Ok(Self::Context),
            "process" => Ok(Self::Process),
            other => Err(super::Error::Config(format!(
                "Unknown isolation '{}'. Supported: 'context', 'process'",
                other
            ))),
        }
    }
}

/// Runner settings
#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Isolation strategy for each assembly
    #[serde(default)]
    pub isolation: Isolation,

    /// Copy assemblies into a private directory before loading
    #[serde(default = "default_shadow_copy")]
    pub shadow_copy: bool,

    /// Per-test timeout when the package does not specify one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            shadow_copy: default_shadow_copy(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_shadow_copy() -> bool {
    true
}
fn default_timeout_ms() -> u64 {
    60_000
}

/// Agency settings
#[derive(Debug, Deserialize, Clone)]
pub struct AgencyConfig {
    /// Upper bound on agent processes kept in the pool
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,

    /// How long a runner waits for a free agent
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// How long a freshly launched agent may take to register
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            max_agents: default_max_agents(),
            acquire_timeout_secs: default_acquire_timeout(),
            launch_timeout_secs: default_launch_timeout(),
        }
    }
}

fn default_max_agents() -> usize {
    4
}
fn default_acquire_timeout() -> u64 {
    5
}
fn default_launch_timeout() -> u64 {
    10
}

impl AgencyConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }
}

/// File watcher settings
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    /// Reload automatically when a loaded assembly changes
    #[serde(default)]
    pub enabled: bool,

    /// Quiet period before a change is acted on
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Run the tests again after an automatic reload
    #[serde(default)]
    pub rerun_on_change: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce(),
            rerun_on_change: false,
        }
    }
}

fn default_debounce() -> u64 {
    500
}

/// Result output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// File name written next to the loaded package after each run
    #[serde(default = "default_result_file")]
    pub result_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            result_file: default_result_file(),
        }
    }
}

fn default_result_file() -> String {
    "TestResult.json".to_string()
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::parse(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.runner.isolation, Isolation::Context);
        assert!(config.runner.shadow_copy);
        assert_eq!(config.agency.acquire_timeout_secs, 5);
        assert_eq!(config.output.result_file, "TestResult.json");
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [runner]
            isolation = "process"

            [watch]
            enabled = true
            rerun_on_change = true
            "#,
        )
        .unwrap();
        assert_eq!(config.runner.isolation, Isolation::Process);
        assert!(config.watch.enabled);
        assert!(config.watch.rerun_on_change);
        assert_eq!(config.watch.debounce_ms, 500);
    }

    #[test]
    fn test_invalid_config_is_parse_error() {
        let err = Config::parse("[runner]\nisolation = 3").unwrap_err();
        assert!(matches!(err, super::super::Error::ConfigParse(_)));
    }
}
