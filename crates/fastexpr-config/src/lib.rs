//! Configuration system for fastexpr.
//!
//! Load compiler configuration from TOML or YAML to control the closure
//! layout threshold, the native tier and the interpreter fallback without
//! code changes.
//!
//! # Examples
//!
//! Load configuration from TOML string:
//!
//! ```
//! use fastexpr_config::CompilerConfig;
//!
//! let config = CompilerConfig::from_toml_str(r#"
//!     environment_mode = "full_assert"
//!
//!     [closure]
//!     fixed_field_limit = 4
//!
//!     [native]
//!     enabled = false
//! "#).unwrap();
//!
//! assert_eq!(config.closure.fixed_field_limit, 4);
//! assert!(!config.native.enabled);
//! assert!(config.fallback.enabled);
//! ```
//!
//! Use default config when file is missing:
//!
//! ```
//! use fastexpr_config::CompilerConfig;
//!
//! let config = CompilerConfig::load("fastexpr.toml").unwrap_or_default();
//! // Proceeds with defaults if file doesn't exist
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;


/// Largest closure that still uses the fixed-field record strategy.
pub const DEFAULT_FIXED_FIELD_LIMIT: usize = 10;

/// Upper bound for the fixed-field strategy; records are generated up to this arity.
pub const MAX_FIXED_FIELD_LIMIT: usize = 16;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main compiler configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct CompilerConfig {
    /// Environment mode affecting internal assertions.
    #[serde(default)]
    pub environment_mode: EnvironmentMode,

    /// Closure layout configuration.
    #[serde(default)]
    pub closure: ClosureConfig,

    /// Native tier configuration.
    #[serde(default)]
    pub native: NativeConfig,

    /// Interpreter fallback configuration.
    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl CompilerConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if file doesn't exist or contains invalid TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_file(path)
    }

    /// Loads configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()
    }

    /// Loads configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()
    }

    /// Sets the fixed-field closure threshold, clamped to
    /// [`MAX_FIXED_FIELD_LIMIT`]. Parsed files above the maximum are
    /// rejected instead.
    pub fn with_fixed_field_limit(mut self, limit: usize) -> Self {
        self.closure.fixed_field_limit = limit.min(MAX_FIXED_FIELD_LIMIT);
        self
    }

    /// Enables or disables the native tier.
    pub fn with_native(mut self, enabled: bool) -> Self {
        self.native.enabled = enabled;
        self
    }

    /// Enables or disables the interpreter fallback.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback.enabled = enabled;
        self
    }

    /// Sets the environment mode.
    pub fn with_environment_mode(mut self, mode: EnvironmentMode) -> Self {
        self.environment_mode = mode;
        self
    }

    /// Returns true if every emitted unit, nested ones included, should be
    /// re-verified after linking.
    pub fn verify_emitted_code(&self) -> bool {
        matches!(self.environment_mode, EnvironmentMode::FullAssert)
    }

    /// Returns true if root units should be re-verified after linking.
    pub fn verify_root_units(&self) -> bool {
        matches!(
            self.environment_mode,
            EnvironmentMode::FastAssert | EnvironmentMode::FullAssert
        )
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.closure.fixed_field_limit > MAX_FIXED_FIELD_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "closure.fixed_field_limit must be at most {MAX_FIXED_FIELD_LIMIT}, got {}",
                self.closure.fixed_field_limit
            )));
        }
        Ok(self)
    }
}

/// Environment mode affecting compiler assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentMode {
    /// Minimal overhead, no post-link verification.
    #[default]
    NonReproducible,

    /// Root units are re-verified after linking.
    FastAssert,

    /// Full assert mode: every emitted unit is re-verified.
    FullAssert,
}

/// Closure layout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ClosureConfig {
    /// Closures with at most this many items use fixed-field records.
    #[serde(default = "default_fixed_field_limit")]
    pub fixed_field_limit: usize,
}

impl Default for ClosureConfig {
    fn default() -> Self {
        Self {
            fixed_field_limit: DEFAULT_FIXED_FIELD_LIMIT,
        }
    }
}

fn default_fixed_field_limit() -> usize {
    DEFAULT_FIXED_FIELD_LIMIT
}

/// Native tier configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct NativeConfig {
    /// Lower eligible integer units to machine code.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Units longer than this stay on the bytecode VM.
    #[serde(default = "default_max_native_instructions")]
    pub max_instructions: usize,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_instructions: default_max_native_instructions(),
        }
    }
}

fn default_max_native_instructions() -> usize {
    4096
}

/// Interpreter fallback configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FallbackConfig {
    /// Hand declined trees to the reference evaluator.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}
