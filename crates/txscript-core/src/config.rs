//! Persistent configuration for txscript.
//!
//! Settings live in `~/.txscript/config.json`. Missing keys take their
//! defaults, so a config file only needs the values it overrides.
//!
//! # Example
//!
//! ```no_run
//! use txscript_core::config::TxScriptConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = TxScriptConfig::load();
//! println!("max call depth: {}", config.executor.max_call_depth);
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_FILENAME: &str = "config.json";

/// Returns the txscript home directory (`~/.txscript/`), creating it if needed.
pub fn txscript_dir() -> PathBuf {
    let dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".txscript");
    std::fs::create_dir_all(&dir).ok();
    dir
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Interpreter tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum nesting of user function calls.
    pub max_call_depth: usize,
    /// Statements a task executes before giving other tasks a turn.
    pub yield_every: usize,
    /// Error log capacity per run. Errors past this are counted, not stored.
    pub max_error_log: usize,
    /// `print` output ring buffer size.
    pub max_output_log: usize,
    /// Per-run inbound frame buffer.
    pub frame_buffer: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 128,
            yield_every: 32,
            max_error_log: 10_000,
            max_output_log: 1000,
            frame_buffer: 256,
        }
    }
}

/// Persistent txscript configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxScriptConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Ports used by `txscript run` when none are given.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_ports: Vec<String>,
}

impl TxScriptConfig {
    /// Load config from `~/.txscript/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&txscript_dir().join(CONFIG_FILENAME)).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Save config to `~/.txscript/config.json`.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&txscript_dir().join(CONFIG_FILENAME))
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_call_depth, 128);
        assert_eq!(config.max_output_log, 1000);
    }

    #[test]
    fn deserialize_partial_json() {
        let loaded: TxScriptConfig =
            serde_json::from_str(r#"{"executor": {"yield_every": 4}, "default_ports": ["can1"]}"#).unwrap();
        assert_eq!(loaded.executor.yield_every, 4);
        assert_eq!(loaded.executor.max_call_depth, 128);
        assert_eq!(loaded.default_ports, vec!["can1".to_string()]);
    }

    #[test]
    fn deserialize_empty_json() {
        let loaded: TxScriptConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, TxScriptConfig::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let path = std::env::temp_dir().join(format!("txscript-config-{}.json", uuid::Uuid::new_v4()));
        let config = TxScriptConfig {
            executor: ExecutorConfig { max_call_depth: 16, ..Default::default() },
            default_ports: vec!["can0".into(), "can1".into()],
        };
        config.save_to(&path).unwrap();
        assert_eq!(TxScriptConfig::load_from(&path).unwrap(), config);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = TxScriptConfig::load_from(Path::new("/nonexistent/txscript.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
