use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::ResourceLimits;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory the store persists its collections under.
    /// Supports ${ENV_VAR} substitution.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    /// Wall-clock budget for one script execution, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ceiling on VM instructions executed per call.
    #[serde(default = "default_instruction_budget")]
    pub instruction_budget: u64,
    /// Ceiling on sandbox allocations, in bytes.
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,
    /// Largest `limit` a script may pass to search().
    #[serde(default = "default_max_search_limit")]
    pub max_search_limit: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ValidatorConfig {
    /// Escalates the unbounded-loop heuristic from a warning to a hard
    /// validation failure.
    #[serde(default)]
    pub strict_loops: bool,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./data/store")
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_instruction_budget() -> u64 {
    10_000_000
}

fn default_memory_limit_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_search_limit() -> usize {
    100
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            instruction_budget: default_instruction_budget(),
            memory_limit_bytes: default_memory_limit_bytes(),
            max_search_limit: default_max_search_limit(),
        }
    }
}

impl LimitsConfig {
    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_millis(self.timeout_ms),
            instruction_budget: self.instruction_budget,
            memory_limit_bytes: self.memory_limit_bytes,
            max_search_limit: self.max_search_limit,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${MEMQL_STORE_PATH}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store.path, PathBuf::from("./data/store"));
        assert_eq!(config.limits.timeout_ms, 5_000);
        assert_eq!(config.limits.instruction_budget, 10_000_000);
        assert_eq!(config.limits.max_search_limit, 100);
        assert!(!config.validator.strict_loops);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.limits.timeout_ms, 5_000);
        assert_eq!(config.limits.memory_limit_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_partial_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            timeout_ms = 250

            [validator]
            strict_loops = true
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.timeout_ms, 250);
        // Untouched fields keep their defaults
        assert_eq!(config.limits.instruction_budget, 10_000_000);
        assert!(config.validator.strict_loops);
    }

    #[test]
    fn test_resource_limits_conversion() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            timeout_ms = 100
            instruction_budget = 1000
            memory_limit_bytes = 4096
            max_search_limit = 7
            "#,
        )
        .unwrap();
        let limits = config.limits.resource_limits();
        assert_eq!(limits.timeout, Duration::from_millis(100));
        assert_eq!(limits.instruction_budget, 1000);
        assert_eq!(limits.memory_limit_bytes, 4096);
        assert_eq!(limits.max_search_limit, 7);
    }

    #[test]
    fn test_env_substitution() {
        std::env::set_var("MEMQL_TEST_STORE", "/tmp/memql-test");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memql.toml");
        std::fs::write(&path, "[store]\npath = \"${MEMQL_TEST_STORE}\"\n").unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/memql-test"));
    }
}
