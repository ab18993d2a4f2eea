//! Runtime tunables, loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Tunables shared by every scope actor started from one runtime.
///
/// ```toml
/// call_timeout_ms = 5000
/// inbox_capacity = 1024
/// relay_capacity = 1024
/// control_capacity = 64
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
	/// Default timeout for `call` operations, in milliseconds.
	pub call_timeout_ms: u64,
	/// Capacity of each actor inbox.
	pub inbox_capacity: usize,
	/// Capacity of each relay queue.
	pub relay_capacity: usize,
	/// Capacity of the local control channel of each actor.
	pub control_capacity: usize,
}

impl Default for ScopeConfig {
	fn default() -> Self {
		Self {
			call_timeout_ms: 5_000,
			inbox_capacity: 1_024,
			relay_capacity: 1_024,
			control_capacity: 64,
		}
	}
}

impl ScopeConfig {
	pub fn call_timeout(&self) -> Duration {
		Duration::from_millis(self.call_timeout_ms)
	}

	/// Parses and validates a TOML document. Missing keys take defaults.
	pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(source)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads and parses a TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let source = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&source)
	}

	/// Rejects zero timeouts and capacities.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.call_timeout_ms == 0 {
			return Err(ConfigError::Invalid("call_timeout_ms must be > 0".into()));
		}
		for (field, value) in [
			("inbox_capacity", self.inbox_capacity),
			("relay_capacity", self.relay_capacity),
			("control_capacity", self.control_capacity),
		] {
			if value == 0 {
				return Err(ConfigError::Invalid(format!("{field} must be > 0")));
			}
		}
		Ok(())
	}
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// Error parsing TOML syntax or an unknown key.
	#[error("TOML parse error: {0}")]
	Parse(#[from] toml::de::Error),

	/// A value is out of range.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}
