//! Runtime configuration
//!
//! Loaded from TOML, then optionally overridden from the environment:
//!
//! ```toml
//! node_name = "node-a"
//! workers = 8
//! throughput = 64
//! ```

use crate::error::{AgentError, Result};
use crate::routing::node_address;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_NODE_NAME: &str = "AGENTRY_NODE_NAME";
pub const ENV_WORKERS: &str = "AGENTRY_WORKERS";
pub const ENV_THROUGHPUT: &str = "AGENTRY_THROUGHPUT";

/// Runtime environment configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name this node registers under with its peers (`http://<node_name>`)
    pub node_name: String,
    /// Worker threads draining mailboxes
    pub workers: usize,
    /// Messages one port may handle before yielding its worker
    pub throughput: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(2);
        RuntimeConfig {
            node_name: "localhost".to_string(),
            workers,
            throughput: 32,
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(content)
            .map_err(|e| AgentError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Apply `AGENTRY_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var(ENV_NODE_NAME) {
            self.node_name = name;
        }
        if let Ok(workers) = std::env::var(ENV_WORKERS) {
            self.workers = parse_count(ENV_WORKERS, &workers)?;
        }
        if let Ok(throughput) = std::env::var(ENV_THROUGHPUT) {
            self.throughput = parse_count(ENV_THROUGHPUT, &throughput)?;
        }
        self.validate()
    }

    /// Address peers use to reach this node
    pub fn node_address(&self) -> String {
        node_address(&self.node_name)
    }

    fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() || self.node_name.contains(['/', ':', ' ']) {
            return Err(AgentError::Config(format!(
                "Invalid node name {:?}",
                self.node_name
            )));
        }
        if self.workers == 0 {
            return Err(AgentError::Config("workers must be at least 1".to_string()));
        }
        if self.throughput == 0 {
            return Err(AgentError::Config("throughput must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| AgentError::Config(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.node_name, "localhost");
        assert!(config.workers >= 2);
        assert_eq!(config.throughput, 32);
        assert_eq!(config.node_address(), "http://localhost");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml("node_name = \"node-a\"\n").unwrap();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.throughput, 32);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "node_name = \"node-b\"\nworkers = 3\nthroughput = 8").unwrap();

        let config = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config,
            RuntimeConfig {
                node_name: "node-b".to_string(),
                workers: 3,
                throughput: 8,
            }
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            RuntimeConfig::from_toml("workers = 0"),
            Err(AgentError::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml("node_name = \"a/b\""),
            Err(AgentError::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_toml("workers = \"many\""),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = RuntimeConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count(ENV_WORKERS, " 6 ").unwrap(), 6);
        assert!(parse_count(ENV_WORKERS, "six").is_err());
    }

    // The only test that touches the AGENTRY_* variables.
    #[test]
    fn test_env_overrides() {
        std::env::set_var(ENV_NODE_NAME, "node-env");
        std::env::set_var(ENV_WORKERS, "3");
        std::env::remove_var(ENV_THROUGHPUT);

        let mut config = RuntimeConfig::from_toml("throughput = 16").unwrap();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.node_name, "node-env");
        assert_eq!(config.workers, 3);
        assert_eq!(config.throughput, 16);
        assert_eq!(config.node_address(), "http://node-env");

        std::env::set_var(ENV_WORKERS, "many");
        let mut config = RuntimeConfig::default();
        let err = config.apply_env_overrides().unwrap_err();
        assert!(matches!(err, AgentError::Config(ref m) if m.contains(ENV_WORKERS)));

        std::env::set_var(ENV_WORKERS, "0");
        let mut config = RuntimeConfig::default();
        assert!(matches!(config.apply_env_overrides(), Err(AgentError::Config(_))));

        std::env::remove_var(ENV_WORKERS);
        std::env::set_var(ENV_NODE_NAME, "bad/name");
        let mut config = RuntimeConfig::default();
        assert!(matches!(config.apply_env_overrides(), Err(AgentError::Config(_))));

        std::env::remove_var(ENV_NODE_NAME);
    }
}
