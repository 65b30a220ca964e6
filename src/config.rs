use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::js::channel::DEFAULT_CAPACITY;
use crate::js::sandbox::{QuickJsRuntime, SandboxRegistry};

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "FRONTIER_BRIDGE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read bridge config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid bridge config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Payload capacity of each backend's channel buffers, in bytes.
    pub buffer_capacity: usize,
    /// Sandbox kind used for page scripts; `None` disables scripting.
    pub default_sandbox: Option<String>,
    /// Longest chain of documents a `parent` call may pass through.
    pub max_delegation_depth: usize,
    /// Heap limit for each QuickJS sandbox, in bytes.
    pub quickjs_memory_limit: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_CAPACITY,
            default_sandbox: Some(QuickJsRuntime::NAME.to_string()),
            max_delegation_depth: 8,
            quickjs_memory_limit: None,
        }
    }
}

impl BridgeConfig {
    /// Read the config at `config_path`, falling back to defaults when no
    /// path is given or the file does not exist.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(&path)?;
                tracing::debug!(target: "bridge", path = %path.display(), "loading bridge config");
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Like [`BridgeConfig::load`] with the path taken from `FRONTIER_BRIDGE_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer_capacity must be greater than zero".into(),
            ));
        }
        if u32::try_from(self.buffer_capacity).is_err() {
            return Err(ConfigError::Invalid(format!(
                "buffer_capacity {} does not fit the 32-bit length cell",
                self.buffer_capacity
            )));
        }
        if matches!(self.default_sandbox.as_deref(), Some("")) {
            return Err(ConfigError::Invalid(
                "default_sandbox must be a kind name or null".into(),
            ));
        }
        Ok(())
    }

    /// Sandbox kinds available under this config.
    pub fn sandbox_registry(&self) -> SandboxRegistry {
        let mut registry = SandboxRegistry::with_defaults();
        if let Some(limit) = self.quickjs_memory_limit {
            registry.register(
                QuickJsRuntime::NAME,
                std::rc::Rc::new(QuickJsRuntime::with_memory_limit(limit)),
            );
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_default() {
        let config = BridgeConfig::load(None).unwrap();
        assert_eq!(config.buffer_capacity, 10 * 1024 * 1024);
        assert_eq!(config.default_sandbox.as_deref(), Some("quickjs"));
        assert_eq!(config.max_delegation_depth, 8);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = BridgeConfig::load(Some(dir.path().join("absent.yaml"))).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "buffer_capacity: 4096\ndefault_sandbox: null").unwrap();
        let config = BridgeConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.buffer_capacity, 4096);
        assert_eq!(config.default_sandbox, None);
        assert_eq!(config.max_delegation_depth, 8);
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "buffer_capacity: 0").unwrap();
        assert!(matches!(
            BridgeConfig::load(Some(file.path().to_path_buf())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "buffer_capacity: [1, 2").unwrap();
        assert!(matches!(
            BridgeConfig::load(Some(file.path().to_path_buf())),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn memory_limit_keeps_quickjs_registered() {
        let config = BridgeConfig {
            quickjs_memory_limit: Some(32 * 1024 * 1024),
            ..BridgeConfig::default()
        };
        assert_eq!(config.sandbox_registry().kinds(), vec!["quickjs".to_string()]);
    }
}
