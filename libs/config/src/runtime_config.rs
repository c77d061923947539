//! Runtime Configuration Module
//!
//! Loads node settings from a TOML file with `HIVE_*` environment overrides.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Per-worker dispatch weights, indexed by worker id
///
/// `-1` handles one message per turn, `0` drains the backlog seen at turn
/// start, `k` drains `backlog >> k`.
pub const DEFAULT_WEIGHTS: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3,
    3, 3, 3,
];

/// Settings for one node
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads
    pub thread: usize,

    /// Harbor id placed in the high byte of every local handle
    pub harbor: u8,

    /// `"module args"` launched once the logger is up
    pub bootstrap: String,

    /// Module used for the `.logger` service
    pub logservice: String,

    /// Logger output file; stdout when unset
    pub logger: Option<String>,

    /// Directory for per-service `LOGON` files
    pub logpath: Option<PathBuf>,

    /// Account CPU time per dispatch
    pub profile: bool,

    /// Hang monitor check interval
    pub monitor_interval_ms: u64,

    /// Dispatch weights; workers past the end get 0
    pub weights: Vec<i32>,

    /// Extra entries seeded into the runtime environment table
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread: 8,
            harbor: 1,
            bootstrap: "echo".to_string(),
            logservice: "logger".to_string(),
            logger: None,
            logpath: None,
            profile: true,
            monitor_interval_ms: 5000,
            weights: DEFAULT_WEIGHTS.to_vec(),
            env: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a file with environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading runtime config: {:?}", path);

        let config = Config::builder()
            .add_source(File::from(path).required(true))
            // Override with environment variables (HIVE_ prefix)
            .add_source(Environment::with_prefix("HIVE").try_parsing(true))
            .build()
            .context("Failed to build configuration")?;

        let mut config: RuntimeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without consulting the environment
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .context("Failed to build configuration")?;

        let mut config: RuntimeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in path values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        if let Some(logger) = &self.logger {
            let expanded = shellexpand::env(logger).context("Failed to expand logger path")?;
            self.logger = Some(expanded.to_string());
        }

        if let Some(logpath) = &self.logpath {
            let raw = logpath.to_string_lossy();
            let expanded = shellexpand::env(&raw).context("Failed to expand logpath")?;
            self.logpath = Some(PathBuf::from(expanded.as_ref()));
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread == 0 {
            bail!("thread must be at least 1");
        }
        if self.monitor_interval_ms == 0 {
            bail!("monitor_interval_ms must be positive");
        }
        if let Some(w) = self.weights.iter().find(|w| **w < -1) {
            bail!("invalid dispatch weight {}", w);
        }
        if self.bootstrap.trim().is_empty() {
            bail!("bootstrap must name a module");
        }
        Ok(())
    }

    /// Weight for worker `index`
    pub fn weight_for(&self, index: usize) -> i32 {
        self.weights.get(index).copied().unwrap_or(0)
    }

    /// Scalar settings as the key/value pairs seeded into the environment table
    pub fn env_table(&self) -> Vec<(String, String)> {
        let mut table = vec![
            ("thread".to_string(), self.thread.to_string()),
            ("harbor".to_string(), self.harbor.to_string()),
            ("bootstrap".to_string(), self.bootstrap.clone()),
            ("logservice".to_string(), self.logservice.clone()),
            ("profile".to_string(), self.profile.to_string()),
        ];
        if let Some(logger) = &self.logger {
            table.push(("logger".to_string(), logger.clone()));
        }
        if let Some(logpath) = &self.logpath {
            table.push(("logpath".to_string(), logpath.display().to_string()));
        }
        for (key, value) in &self.env {
            table.push((key.clone(), value.clone()));
        }
        debug!("Seeding {} environment entries", table.len());
        table
    }

    /// Render the effective configuration back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Convenience function: load `path` if given, otherwise use defaults
pub fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => {
            let config = RuntimeConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.thread, 8);
        assert_eq!(config.harbor, 1);
        assert_eq!(config.logservice, "logger");
        assert_eq!(config.monitor_interval_ms, 5000);
        assert_eq!(config.weight_for(3), -1);
        assert_eq!(config.weight_for(4), 0);
        assert_eq!(config.weight_for(8), 1);
        assert_eq!(config.weight_for(31), 3);
        assert_eq!(config.weight_for(32), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
thread = 2
bootstrap = "echo hello"
weights = [0, 2]

[env]
cluster = "local"
"#,
        )
        .unwrap();

        assert_eq!(config.thread, 2);
        assert_eq!(config.bootstrap, "echo hello");
        assert_eq!(config.weights, vec![0, 2]);
        assert_eq!(config.weight_for(2), 0);
        assert_eq!(config.harbor, 1);
        assert!(config.profile);

        let table = config.env_table();
        assert!(table.contains(&("thread".to_string(), "2".to_string())));
        assert!(table.contains(&("cluster".to_string(), "local".to_string())));
        assert!(!table.iter().any(|(k, _)| k == "logger"));
    }

    #[test]
    fn test_validation_failures() {
        assert!(RuntimeConfig::from_toml_str("thread = 0").is_err());
        assert!(RuntimeConfig::from_toml_str("weights = [-2]").is_err());
        assert!(RuntimeConfig::from_toml_str("bootstrap = \"  \"").is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("node.toml");
        fs::write(
            &config_path,
            r#"
thread = 4
harbor = 3
logger = "/tmp/hive.log"
monitor_interval_ms = 1000
"#,
        )
        .unwrap();

        std::env::set_var("HIVE_MONITOR_INTERVAL_MS", "250");
        let config = RuntimeConfig::load(&config_path).unwrap();
        std::env::remove_var("HIVE_MONITOR_INTERVAL_MS");

        assert_eq!(config.thread, 4);
        assert_eq!(config.harbor, 3);
        assert_eq!(config.logger.as_deref(), Some("/tmp/hive.log"));
        assert_eq!(config.monitor_interval_ms, 250);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
        assert_eq!(load_config(None).unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_toml_render_parses_back() {
        let config = RuntimeConfig {
            thread: 3,
            logpath: Some(PathBuf::from("/var/log/hive")),
            ..RuntimeConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert_eq!(RuntimeConfig::from_toml_str(&text).unwrap(), config);
    }
}
