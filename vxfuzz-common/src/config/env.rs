//! Environment variable parsing with type safety.
//!
//! Every getter returns `None` when the variable is unset, so values only
//! override the file configuration when someone actually set them. Parse
//! errors are collected so all of them can be reported at once.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the VXFUZZ_ prefix.
    pub fn new() -> Self {
        Self {
            prefix: "VXFUZZ_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if !value.trim().is_empty() => Some((var_name, value)),
            _ => None,
        }
    }

    /// Get a string value.
    pub fn get_string(&mut self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, value)| value)
    }

    /// Get a path value with ~ expansion.
    pub fn get_path(&mut self, name: &str) -> Option<PathBuf> {
        self.raw(name).map(|(_, value)| expand_home(&value))
    }

    /// Get a u16 value.
    pub fn get_u16(&mut self, name: &str) -> Option<u16> {
        let (var, value) = self.raw(name)?;
        match value.trim().parse::<u16>() {
            Ok(n) => Some(n),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned 16-bit integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a u64 value.
    pub fn get_u64(&mut self, name: &str) -> Option<u64> {
        let (var, value) = self.raw(name)?;
        match value.trim().parse::<u64>() {
            Ok(n) => Some(n),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned 64-bit integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a human-readable duration (`500ms`, `2s`, `1h 30m`).
    pub fn get_duration(&mut self, name: &str) -> Option<Duration> {
        let (var, value) = self.raw(name)?;
        match humantime::parse_duration(value.trim()) {
            Ok(d) => Some(d),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                None
            }
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str) -> Option<String> {
        let (var, value) = self.raw(name)?;
        let lower = value.trim().to_lowercase();
        match lower.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" | "off" => Some(lower),
            _ => {
                self.errors.push(EnvError::InvalidLogLevel { var, value });
                None
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(value)
}
