//! # Engine Configuration
//!
//! Everything the engine needs to know before it sees data: the two kernel bandwidths and
//! the capacity of the in-memory training matrix. The configuration is a plain TOML file,
//! so the same settings can be shipped with a device image and loaded by the CLI.
//!
//! Missing keys fall back to the device defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Largest dataset the device build was dimensioned for.
pub const DEFAULT_MAX_ROWS: usize = 152;
pub const DEFAULT_MAX_COLS: usize = 20;
/// Size of the scratch buffer the loader streams the dataset through.
pub const DEFAULT_READ_BUFFER_BYTES: usize = 512 * 20 * 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Bandwidth '{name}' must be positive and finite, got {value}.")]
    InvalidBandwidth { name: &'static str, value: f64 },
    #[error("Capacity '{0}' must be greater than zero.")]
    ZeroCapacity(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stage-1 kernel width.
    pub sigma1: f64,
    /// Stage-2 and query-path kernel width.
    pub sigma2: f64,
    /// Maximum number of data rows the loader accepts (R_max).
    pub max_rows: usize,
    /// Maximum number of columns per row, label included (C_max).
    pub max_cols: usize,
    pub read_buffer_bytes: usize,
    /// Reject unparseable numeric fields instead of reading them as 0.
    pub strict_numbers: bool,
    /// Let each row weigh itself when computing its stage-1 pseudo-label.
    pub include_self_in_stage1: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sigma1: 0.1,
            sigma2: 0.2,
            max_rows: DEFAULT_MAX_ROWS,
            max_cols: DEFAULT_MAX_COLS,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
            strict_numbers: false,
            include_self_in_stage1: false,
        }
    }
}

impl EngineConfig {
    pub fn with_bandwidths(sigma1: f64, sigma2: f64) -> Self {
        Self {
            sigma1,
            sigma2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_bandwidth("sigma1", self.sigma1)?;
        validate_bandwidth("sigma2", self.sigma2)?;
        if self.max_rows == 0 {
            return Err(ConfigError::ZeroCapacity("max_rows"));
        }
        if self.max_cols == 0 {
            return Err(ConfigError::ZeroCapacity("max_cols"));
        }
        if self.read_buffer_bytes == 0 {
            return Err(ConfigError::ZeroCapacity("read_buffer_bytes"));
        }
        Ok(())
    }

    /// Loads and validates a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

pub(crate) fn validate_bandwidth(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidBandwidth { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let config: EngineConfig = toml::from_str("sigma1 = 0.5\nmax_rows = 40\n").unwrap();
        assert_eq!(config.sigma1, 0.5);
        assert_eq!(config.sigma2, 0.2);
        assert_eq!(config.max_rows, 40);
        assert_eq!(config.max_cols, DEFAULT_MAX_COLS);
        assert!(!config.strict_numbers);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let config = EngineConfig {
            strict_numbers: true,
            ..EngineConfig::with_bandwidths(1.5, 0.75)
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn rejects_non_positive_bandwidths() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = EngineConfig::with_bandwidths(bad, 1.0).validate().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::InvalidBandwidth { name: "sigma1", .. }
            ));
        }
        let err = EngineConfig {
            max_cols: 0,
            ..EngineConfig::default()
        }
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroCapacity("max_cols")));
    }
}
